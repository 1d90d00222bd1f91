//! exthost - process-isolated extension host
//!
//! Runs editor-style JavaScript extensions, one worker process per extension,
//! behind a newline-delimited JSON protocol:
//! - [`host`]: discovery, spawn, command routing, event broadcast, shutdown
//! - [`worker`] / [`worker_js`]: the worker side, an embedded QuickJS runtime
//! - [`loader`]: module resolution pinned to each extension's root
//! - [`commands`] / [`permissions`]: the command registry, execution history
//!   and the allow/deny policy consulted before every execution

#![forbid(unsafe_code)]
#![allow(
    clippy::must_use_candidate,
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod host;
pub mod host_requests;
pub mod lifecycle;
pub mod loader;
pub mod manifest;
pub mod permissions;
pub mod protocol;
pub mod router;
pub mod storage;
pub mod worker;
pub mod worker_js;

pub use error::{Error, Result};
