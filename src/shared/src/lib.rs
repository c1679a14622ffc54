//! Shared types for the file-sharing platform notification core

pub mod types;

pub use types::*;
