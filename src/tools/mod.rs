//! Typed tool registry, spec parsing, interpreter pool, and auto-fix.

pub mod autofix;
pub mod interp;
mod registry;
mod spec;
#[cfg(feature = "sqlite")]
pub mod sql;

pub use registry::{RegisteredTool, ToolError, ToolKind, ToolRegistry};
pub use spec::{backoff_delay, execute_with_retry, parse_timeout, parse_tool_target, ToolTarget};
