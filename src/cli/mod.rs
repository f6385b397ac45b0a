//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Running the translation server
//! - One-shot local translation
//! - Accelerator checks
//! - Configuration inspection

pub mod commands;
pub mod handlers;

pub use handlers::{
    handle_config, handle_device, handle_server, handle_translate, init_logging, validate_config,
};
