pub mod alerts;
pub mod config;
pub mod http;
pub mod jobs;
pub mod kv;
pub mod merge;
pub mod metrics;
pub mod notify;
pub mod queue;
pub mod status;
pub mod store;
pub mod translog;
pub mod worker;
