//! CLI command implementations.

pub mod cancel;
pub mod check;
pub mod common;
pub mod recover;
pub mod status;
pub mod submit;
pub mod version;
pub mod workspace;
