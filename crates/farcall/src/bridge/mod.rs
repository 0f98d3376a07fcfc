//! Message channel plumbing between host and worker.
//!
//! # Architecture
//!
//! - **protocol**: Envelope types (Request, Response, announcement)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **channel**: Typed reader/writer pairs for each side of the channel

pub mod channel;
pub mod codec;
pub mod protocol;
