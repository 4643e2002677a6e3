//! `mb-domain`: shared types for the mcpbridge workspace.
//!
//! Holds the configuration model, the workspace-wide error type, the
//! normalized tool records handed to callers, and structured trace events.

pub mod config;
pub mod error;
pub mod tool;
pub mod trace;

pub use error::{Error, Result};
pub use tool::{CallResult, ContentBlock, ToolDescriptor, ToolStatus};
