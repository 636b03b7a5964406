//! Error handling foundation for edgewise.
//!
//! This module provides only the `Result` type alias using rootcause.
//! Each crate defines its own domain-specific error types, and boundary
//! code (the dispatcher, the CLI) reports them wrapped in a `Report` so
//! that failures carry their full context to whichever worker inspects them.

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;
