//! Subscribe to an MQTT broker and write every delivered message to syslog.
//!
//! The MQTT session runs on a tokio task and only queues work; formatting
//! and the blocking syslog writes happen on a fixed pool of OS threads
//! ([`pool::worker_pool::WorkerPool`]).

pub mod broker;
pub mod cli;
pub mod helpers;
pub mod instrumentation;
pub mod logger;
pub mod metrics;
pub mod pool;
pub mod runtime;
