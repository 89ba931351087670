//! # carillon-core
//!
//! Core types, the byte-stream file abstraction, and error handling for the
//! Carillon game-audio engine.

pub mod error;
pub mod path;
pub mod types;
pub mod vfs;

pub use error::{Error, Result};
pub use path::normalize_path;
pub use types::*;
pub use vfs::{ByteStream, DiskVfs, MemoryVfs, Vfs};
