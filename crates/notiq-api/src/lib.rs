//! HTTP ingestion layer.
//!
//! One inbound endpoint per provider plus health probes. A provider gets
//! its 200 only after the event is durably enqueued; validation and parse
//! failures answer 4xx so well-behaved providers stop retrying.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use handlers::AppState;
pub use server::{create_router, start_server};
