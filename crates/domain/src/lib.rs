//! `tess-domain` — shared types for the Tessera execution engine.
//!
//! Everything that crosses a crate boundary lives here: the error type,
//! the plan model, tool descriptors and outputs, the canonical SSE event
//! model, the clock capability, and the configuration tree.

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod plan;
pub mod tool;

pub use error::{Error, Result};
