//! In-memory source/sink pair for embedding the server without sockets.

use super::{DocumentSink, DocumentSource};
use crate::error::RelayError;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Create a bounded in-memory frame channel.
pub fn channel(buffer: usize) -> (ChannelSink, ChannelSource) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (ChannelSink { tx }, ChannelSource { rx })
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

pub struct ChannelSource {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl DocumentSink for ChannelSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), RelayError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| RelayError::Closed("in-memory channel".to_string()))
    }
}

#[async_trait]
impl DocumentSource for ChannelSource {
    async fn recv(&mut self) -> Result<Option<Bytes>, RelayError> {
        Ok(self.rx.recv().await)
    }
}
