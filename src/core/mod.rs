//! Core domain models for pipelines
//!
//! This module defines the fundamental data structures that represent
//! pipelines, steps, datasources and artifacts, and their configuration.

pub mod artifact;
pub mod config;
pub mod context;
pub mod datasource;
pub mod fingerprint;
pub mod pipeline;
pub mod source;
pub mod state;
pub mod step;

pub use artifact::*;
pub use context::*;
pub use datasource::*;
pub use pipeline::*;
pub use source::*;
pub use state::*;
pub use step::*;
