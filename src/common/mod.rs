//! Common utilities and types shared across zooweeper

pub mod config;
pub mod error;
pub mod tracing_middleware;
pub mod utils;

pub use config::NodeConfig;
pub use error::{Error, Result};
pub use utils::{
    compare_addresses, is_port, quorum, sender_of, timestamp_now_millis,
    FORWARDED_HEADER, SENDER_HEADER,
};
