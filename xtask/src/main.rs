//! Build tasks for write-tracer.
//!
//! This tool handles cross-compilation of the eBPF programs to the BPF
//! target.
//!
//! Usage:
//!   cargo xtask build-ebpf            # Build eBPF programs (debug)
//!   cargo xtask build-ebpf --release  # Build eBPF programs (release)

use std::path::PathBuf;
use std::process::Command;
use std::{env, fs};

use anyhow::{bail, Context, Result};
use clap::Parser;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build tasks for write-tracer")]
enum Cli {
    /// Build the eBPF programs
    BuildEbpf {
        /// Build in release mode
        #[arg(long)]
        release: bool,
    },
    /// Build everything (eBPF + userspace)
    Build {
        /// Build in release mode
        #[arg(long)]
        release: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli {
        Cli::BuildEbpf { release } => build_ebpf(release),
        Cli::Build { release } => {
            build_ebpf(release)?;
            build_userspace(release)
        }
    }
}

fn build_ebpf(release: bool) -> Result<()> {
    let workspace_root = workspace_root()?;
    let ebpf_dir = workspace_root.join("write-tracer-ebpf");

    if !ebpf_dir.exists() {
        bail!("write-tracer-ebpf directory not found at {}", ebpf_dir.display());
    }

    println!("Building eBPF programs...");

    let target_bpf_dir = workspace_root.join("target/bpf");
    fs::create_dir_all(&target_bpf_dir).context("Failed to create target/bpf directory")?;

    // build-std needs nightly; the BPF target has no prebuilt core.
    let mut cmd = Command::new("cargo");
    cmd.current_dir(&workspace_root);
    cmd.arg("+nightly");
    cmd.args(["build", "-p", "write-tracer-ebpf"]);
    cmd.args(["--target", "bpfel-unknown-none"]);
    cmd.args(["-Z", "build-std=core"]);

    if release {
        cmd.arg("--release");
    }

    cmd.args(["--target-dir", "target"]);

    let status = cmd.status().context("Failed to run cargo build for eBPF")?;
    if !status.success() {
        bail!("eBPF build failed");
    }

    let profile = if release { "release" } else { "debug" };
    let built_path = workspace_root
        .join("target/bpfel-unknown-none")
        .join(profile)
        .join("write-tracer-ebpf");

    let output_path = target_bpf_dir.join("write_tracer.o");
    fs::copy(&built_path, &output_path).with_context(|| {
        format!(
            "Failed to copy {} to {}",
            built_path.display(),
            output_path.display()
        )
    })?;
    println!("eBPF program built: {}", output_path.display());

    Ok(())
}

fn build_userspace(release: bool) -> Result<()> {
    let workspace_root = workspace_root()?;

    println!("Building userspace...");

    let mut cmd = Command::new("cargo");
    cmd.current_dir(&workspace_root);
    cmd.args(["build", "-p", "write-tracer"]);

    if release {
        cmd.arg("--release");
    }

    let status = cmd.status().context("Failed to run cargo build")?;
    if !status.success() {
        bail!("Userspace build failed");
    }

    println!("Build complete!");
    Ok(())
}

fn workspace_root() -> Result<PathBuf> {
    // CARGO_MANIFEST_DIR points to xtask/, the workspace root is one up.
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").context("CARGO_MANIFEST_DIR not set")?;

    let xtask_dir = PathBuf::from(manifest_dir);
    let workspace_root = xtask_dir
        .parent()
        .context("Could not find workspace root")?
        .to_path_buf();

    Ok(workspace_root)
}
