//! Typed ends of the host-worker channel.
//!
//! How the underlying byte stream is obtained (child process stdio, a socket,
//! an in-process duplex) is up to the caller. These helpers only attach the
//! JSON framing codec with the right message type for each direction.

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, Stdin, Stdout, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::JsonCodec;
use super::protocol::{Request, Response};

/// Host side: writes requests, reads responses.
///
/// Responses are decoded as raw JSON and checked with [`Response::from_json`],
/// so one bad envelope only fails the invocation it names.
pub struct HostChannel<R, W> {
    pub reader: FramedRead<R, JsonCodec<serde_json::Value>>,
    pub writer: FramedWrite<W, JsonCodec<Request>>,
}

impl<R: AsyncRead, W: AsyncWrite> HostChannel<R, W> {
    /// For a spawned worker process this is `(child.stdout, child.stdin)`.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FramedRead::new(reader, JsonCodec::new()),
            writer: FramedWrite::new(writer, JsonCodec::new()),
        }
    }
}

impl<T: AsyncRead + AsyncWrite> HostChannel<ReadHalf<T>, WriteHalf<T>> {
    pub fn from_stream(io: T) -> Self {
        let (reader, writer) = tokio::io::split(io);
        Self::new(reader, writer)
    }
}

/// Worker side: reads requests, writes responses.
///
/// Requests are decoded as raw JSON first so a malformed envelope can still be
/// answered when its invocation id is recoverable.
pub struct WorkerChannel<R, W> {
    pub reader: FramedRead<R, JsonCodec<serde_json::Value>>,
    pub writer: FramedWrite<W, JsonCodec<Response>>,
}

impl<R: AsyncRead, W: AsyncWrite> WorkerChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FramedRead::new(reader, JsonCodec::new()),
            writer: FramedWrite::new(writer, JsonCodec::new()),
        }
    }
}

impl<T: AsyncRead + AsyncWrite> WorkerChannel<ReadHalf<T>, WriteHalf<T>> {
    pub fn from_stream(io: T) -> Self {
        let (reader, writer) = tokio::io::split(io);
        Self::new(reader, writer)
    }
}

impl WorkerChannel<Stdin, Stdout> {
    /// Worker running as a subprocess of the host.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

pub type MemoryHostChannel = HostChannel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;
pub type MemoryWorkerChannel = WorkerChannel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// Both ends of an in-process channel backed by `tokio::io::duplex`.
pub fn in_memory(buffer: usize) -> (MemoryHostChannel, MemoryWorkerChannel) {
    let (host_io, worker_io) = tokio::io::duplex(buffer);
    (
        HostChannel::from_stream(host_io),
        WorkerChannel::from_stream(worker_io),
    )
}
