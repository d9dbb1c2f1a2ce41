pub mod ingest;
pub mod network;
pub mod progress;
