//! TCP endpoints: a producer on the relay backend, a consumer on the frontend.

use super::{codec, DocumentSink, DocumentSource};
use crate::error::RelayError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

/// Publishes frames to the relay backend.
pub struct RelayProducer {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    addr: SocketAddr,
}

impl RelayProducer {
    pub async fn connect(addr: SocketAddr, max_frame_length: usize) -> Result<Self, RelayError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!(%addr, "producer connected");
        Ok(Self {
            framed: Framed::new(stream, codec(max_frame_length)),
            addr,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl DocumentSink for RelayProducer {
    async fn send(&mut self, frame: Bytes) -> Result<(), RelayError> {
        self.framed.send(frame).await?;
        Ok(())
    }
}

/// Receives every frame the relay forwards after it connected.
pub struct RelayConsumer {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    addr: SocketAddr,
}

impl RelayConsumer {
    pub async fn connect(addr: SocketAddr, max_frame_length: usize) -> Result<Self, RelayError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!(%addr, "consumer connected");
        Ok(Self {
            framed: Framed::new(stream, codec(max_frame_length)),
            addr,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl DocumentSource for RelayConsumer {
    async fn recv(&mut self) -> Result<Option<Bytes>, RelayError> {
        match self.framed.next().await {
            Some(frame) => Ok(Some(frame?.freeze())),
            None => Ok(None),
        }
    }
}
