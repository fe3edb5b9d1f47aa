//! Shared domain types for the Quill story server.
//!
//! Everything that crosses a crate boundary lives here: the fragment and
//! story models, block and context types, generation logs, the stream
//! event grammar, agent trace records, the error enum and the server
//! configuration.

pub mod blocks;
pub mod config;
pub mod context;
pub mod error;
pub mod fragment;
pub mod genlog;
pub mod story;
pub mod stream;
pub mod tool;
pub mod trace;

pub use error::{Error, Result};
