//! Typed client for a single LXD host, plus resource probing.
//!
//! This crate owns everything that talks to one container host:
//! - [`HostClient`]: the capability trait the rest of frost programs against
//! - [`LxdClient`]: the REST implementation with client-certificate TLS
//! - connect-with-timeout and the process-wide connection cache
//! - the resource probe that turns a host into a [`Resource`] snapshot
//!
//! Failures are never recovered here, only observed (via the metrics hook)
//! and propagated.

pub mod client;
pub mod config;
pub mod connect;
pub mod error;
pub mod metrics_hook;
pub mod resource;
pub mod types;

pub use client::{HostClient, LxdClient};
pub use config::{HostConfig, HostConfigMap};
pub use connect::{connect_host, connect_hosts, evict_host, ConnectError, LxdHost};
pub use error::LxdError;
pub use metrics_hook::set_api_observer;
pub use resource::{over_commit_percent, parse_size, scrape_host, Resource};
pub use types::*;
