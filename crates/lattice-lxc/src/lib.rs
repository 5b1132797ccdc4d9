//! Instance lifecycle engine for Incus and LXD hosts
//!
//! [`Client`] wraps an [`LxcApi`] transport (HTTPS or local unix socket) and
//! drives instances to a desired state: launch, start, stop, delete, list and
//! exec. Every mutating operation is idempotent and bounded by a deadline and
//! a cancellation token.

#![deny(missing_docs)]

pub mod addresses;
pub mod api;
pub mod client;
pub mod config;
pub mod filter;
pub mod http;
pub mod image;
pub mod instances;
pub mod launch;
pub mod operation;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tls;
pub mod transport;

pub use addresses::host_addresses;
pub use client::{Client, ServerName};
pub use config::{Configuration, Timeouts};
pub use filter::ListFilter;
pub use http::HttpLxcClient;
pub use image::{Image, ImageFamily};
pub use instances::CommandOutput;
pub use launch::{FileAction, InstanceKind, LaunchSpec};
pub use transport::{LxcApi, OperationHandle};
