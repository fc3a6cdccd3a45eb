//! Reelforge - staged AI media generation
//!
//! This library crate exposes the pipeline coordinator and configuration
//! for the binary and for integration testing.

pub mod config;
pub mod pipeline;
