//! Terminal destinations for decoded events.

pub mod file;
pub mod loki;

pub use file::FileWriter;
pub use loki::LokiClient;
