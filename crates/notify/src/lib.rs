//! Result reporting for finished synthesis tasks.
//!
//! This crate provides:
//! - `ResultSink` trait for pluggable result destinations
//! - `HttpResultSink`, which uploads artifacts to the job API

pub mod http;
pub mod traits;

pub use http::HttpResultSink;
pub use traits::{ResultSink, SinkError};
