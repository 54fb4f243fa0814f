//! Loki push client.
//!
//! Each event goes out as its own one-entry batch, fire-and-forget from a
//! detached task. The remote is best-effort telemetry: failures are logged at
//! warn and the event is dropped, never retried.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use write_tracer_common::WriteEvent;

use crate::event;

const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct PushRequest {
    streams: Vec<PushStream>,
}

#[derive(Debug, Serialize)]
struct PushStream {
    stream: StreamLabels,
    values: Vec<[String; 2]>,
}

#[derive(Debug, Serialize)]
struct StreamLabels {
    app: &'static str,
    pid: String,
    comm: String,
    fd: String,
}

pub struct LokiClient {
    endpoint: String,
    client: reqwest::Client,
}

impl LokiClient {
    pub fn new(endpoint: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PUSH_TIMEOUT)
            .build()
            .context("build Loki HTTP client")?;
        Ok(Self { endpoint, client })
    }

    /// Push one event. Non-2xx responses are errors, with the response body
    /// carried along for the log line.
    pub async fn push(&self, ev: &WriteEvent) -> Result<()> {
        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let body = push_body(ev, now_ns);

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .context("send Loki push request")?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            bail!("loki returned status {status}: {detail}");
        }
        Ok(())
    }
}

fn push_body(ev: &WriteEvent, now_ns: u128) -> PushRequest {
    PushRequest {
        streams: vec![PushStream {
            stream: StreamLabels {
                app: "write-tracer",
                pid: ev.pid.to_string(),
                comm: event::comm_str(ev).into_owned(),
                fd: ev.fd.to_string(),
            },
            values: vec![[now_ns.to_string(), event::data_str(ev).into_owned()]],
        }],
    }
}
