//! Pure data types for the skua job engine.
//!
//! This crate is a leaf dependency with no async runtime and no I/O. It
//! exists so that consumers (the UI, menus, the scripting layer) can work
//! with job descriptions without pulling the engine's transitive deps.

pub mod job;

// Flat re-exports for convenience
pub use job::*;
