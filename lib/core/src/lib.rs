//! Core types shared across the edgewise workspace.
//!
//! This crate provides the foundational identifiers and the error-handling
//! alias used by the flow engine and its command line front end.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{DispatcherId, NodeInstanceId, ParseIdError};
