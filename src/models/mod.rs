//! Data models for the Stagecraft backend.
//!
//! Field names serialize as camelCase to match the authoring client.

mod deployment;
mod instance;
mod template;
mod tenant;

pub use deployment::*;
pub use instance::*;
pub use template::*;
pub use tenant::*;
