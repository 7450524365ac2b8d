//! fabrun core domain types.
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Filesystem
//! - Runtime specifics
//!
//! All types here represent what a task run *is*: its identity, its variable
//! tree, and its result. How a run is executed lives in `fabrun-worker`.

pub mod error;
pub mod flatten;
pub mod ids;
pub mod result;
pub mod value;

// Re-export commonly used types
pub use error::{RunError, TaskRunError};
pub use ids::{sanitize_name, RunIdent};
pub use result::{ResultCode, TaskResult};
pub use value::{encode_variables, join, EncodePath, VarMap, VarValue, VariableEmitter};
pub use flatten::{FlatValue, VariableFlattener};
