//! Shared test utilities for http-integrator.
//!
//! This crate provides:
//! - A scripted mock transport that records every call
//! - Proptest generators for configuration and request types
//! - Test fixtures with sample configuration and payloads

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod mocks;

pub use generators::*;
pub use mocks::{MockReply, MockTransport, RecordedCall};
