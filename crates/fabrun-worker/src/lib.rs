//! The Factory-PC task runner agent.
//!
//! A long-lived process that polls a central Control Center for work,
//! executes one task at a time by generating a startup script and launching
//! an interpreter on a user-authored wrapper script, supervises the child,
//! and reports structured results back over HTTP.

pub mod config;
pub mod factory;
pub mod process;
pub mod protocol;
pub mod runlog;
pub mod script;
pub mod server;
pub mod status;
pub mod sync;
pub mod taskrun;

/// Version reported to the Control Center in every sync request.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
