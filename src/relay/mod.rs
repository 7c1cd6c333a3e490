//! Publish/subscribe relay and the endpoints that talk to it.
//!
//! ```text
//!  producers ──► backend ──┐                 ┌──► frontend ──► consumer A
//!                          ├── broadcast ────┤
//!  producers ──► backend ──┘  (bounded,      └──► frontend ──► consumer B
//!                              drop-oldest)
//! ```
//!
//! Frames are opaque bytes with a u32 big-endian length prefix. The relay never
//! parses them.

pub mod channel;
pub mod client;
pub mod proxy;

pub use channel::{channel, ChannelSink, ChannelSource};
pub use client::{RelayConsumer, RelayProducer};
pub use proxy::{Relay, RelayHandle, RelayStats};

use crate::error::RelayError;
use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::codec::LengthDelimitedCodec;

/// Where the server reads inbound frames from.
#[async_trait]
pub trait DocumentSource: Send {
    /// Next frame, or `None` once the stream has ended.
    async fn recv(&mut self) -> Result<Option<Bytes>, RelayError>;
}

/// Where the server writes outbound frames to.
#[async_trait]
pub trait DocumentSink: Send {
    async fn send(&mut self, frame: Bytes) -> Result<(), RelayError>;
}

pub(crate) fn codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec()
}
