//! The relay itself: two listeners joined by a broadcast channel.

use super::codec;
use crate::config::RelayConfig;
use crate::error::RelayError;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct RelayCounters {
    producers: AtomicUsize,
    consumers: AtomicUsize,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub producer_count: usize,
    pub consumer_count: usize,
    pub frames_forwarded: u64,
    pub frames_dropped: u64,
}

/// A bound but not yet running relay.
pub struct Relay {
    backend: TcpListener,
    frontend: TcpListener,
    consumer_buffer: usize,
    max_frame_length: usize,
}

impl Relay {
    /// Bind both listeners. Port 0 picks a free port.
    pub async fn bind(config: &RelayConfig) -> Result<Self, RelayError> {
        let backend = TcpListener::bind(config.backend).await?;
        let frontend = TcpListener::bind(config.frontend).await?;
        Ok(Self {
            backend,
            frontend,
            consumer_buffer: config.consumer_buffer.max(1),
            max_frame_length: config.max_frame_length,
        })
    }

    /// Start forwarding on the current tokio runtime.
    pub fn spawn(self) -> Result<RelayHandle, RelayError> {
        let backend_addr = self.backend.local_addr()?;
        let frontend_addr = self.frontend.local_addr()?;
        let (frames, _) = broadcast::channel::<Bytes>(self.consumer_buffer);
        let (shutdown, _) = watch::channel(false);
        let counters = Arc::new(RelayCounters::default());

        let producers = tokio::spawn(accept_producers(
            self.backend,
            frames.clone(),
            Arc::clone(&counters),
            shutdown.subscribe(),
            self.max_frame_length,
        ));
        let consumers = tokio::spawn(accept_consumers(
            self.frontend,
            frames,
            Arc::clone(&counters),
            shutdown.subscribe(),
            self.max_frame_length,
        ));
        info!(%backend_addr, %frontend_addr, "relay listening");

        Ok(RelayHandle {
            backend_addr,
            frontend_addr,
            counters,
            shutdown,
            tasks: vec![producers, consumers],
        })
    }
}

/// Control and introspection for a running relay.
pub struct RelayHandle {
    backend_addr: SocketAddr,
    frontend_addr: SocketAddr,
    counters: Arc<RelayCounters>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayHandle {
    /// Address producers connect to.
    pub fn backend_addr(&self) -> SocketAddr {
        self.backend_addr
    }

    /// Address consumers connect to.
    pub fn frontend_addr(&self) -> SocketAddr {
        self.frontend_addr
    }

    pub fn producer_count(&self) -> usize {
        self.counters.producers.load(Ordering::SeqCst)
    }

    pub fn consumer_count(&self) -> usize {
        self.counters.consumers.load(Ordering::SeqCst)
    }

    pub fn frames_forwarded(&self) -> u64 {
        self.counters.forwarded.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            producer_count: self.producer_count(),
            consumer_count: self.consumer_count(),
            frames_forwarded: self.frames_forwarded(),
            frames_dropped: self.frames_dropped(),
        }
    }

    /// Stop accepting, close every connection and wait for the listeners to exit.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "relay task did not exit cleanly");
            }
        }
        info!(
            forwarded = self.counters.forwarded.load(Ordering::Relaxed),
            dropped = self.counters.dropped.load(Ordering::Relaxed),
            "relay stopped"
        );
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn accept_producers(
    listener: TcpListener,
    frames: broadcast::Sender<Bytes>,
    counters: Arc<RelayCounters>,
    mut shutdown: watch::Receiver<bool>,
    max_frame_length: usize,
) {
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    counters.producers.fetch_add(1, Ordering::SeqCst);
                    debug!(%peer, "producer attached");
                    tokio::spawn(forward_producer(
                        stream,
                        peer,
                        frames.clone(),
                        Arc::clone(&counters),
                        shutdown.clone(),
                        max_frame_length,
                    ));
                }
                Err(err) => warn!(error = %err, "backend accept failed"),
            },
        }
    }
}

async fn forward_producer(
    stream: TcpStream,
    peer: SocketAddr,
    frames: broadcast::Sender<Bytes>,
    counters: Arc<RelayCounters>,
    mut shutdown: watch::Receiver<bool>,
    max_frame_length: usize,
) {
    let mut framed = Framed::new(stream, codec(max_frame_length));
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            frame = framed.next() => match frame {
                Some(Ok(frame)) => {
                    // No subscribers is not an error; the frame is simply not delivered.
                    let _ = frames.send(frame.freeze());
                    counters.forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Some(Err(err)) => {
                    warn!(%peer, error = %err, "producer stream error");
                    break;
                }
                None => break,
            },
        }
    }
    counters.producers.fetch_sub(1, Ordering::SeqCst);
    debug!(%peer, "producer detached");
}

async fn accept_consumers(
    listener: TcpListener,
    frames: broadcast::Sender<Bytes>,
    counters: Arc<RelayCounters>,
    mut shutdown: watch::Receiver<bool>,
    max_frame_length: usize,
) {
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    // Subscribe before counting so a visible consumer never misses a frame.
                    let receiver = frames.subscribe();
                    counters.consumers.fetch_add(1, Ordering::SeqCst);
                    debug!(%peer, "consumer attached");
                    tokio::spawn(feed_consumer(
                        stream,
                        peer,
                        receiver,
                        Arc::clone(&counters),
                        shutdown.clone(),
                        max_frame_length,
                    ));
                }
                Err(err) => warn!(error = %err, "frontend accept failed"),
            },
        }
    }
}

async fn feed_consumer(
    stream: TcpStream,
    peer: SocketAddr,
    mut frames: broadcast::Receiver<Bytes>,
    counters: Arc<RelayCounters>,
    mut shutdown: watch::Receiver<bool>,
    max_frame_length: usize,
) {
    let _ = stream.set_nodelay(true);
    let (mut sink, mut inbound) = Framed::new(stream, codec(max_frame_length)).split();
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            // Consumers never send; end-of-stream means they hung up.
            incoming = inbound.next() => {
                if incoming.is_none() {
                    break;
                }
            }
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    if let Err(err) = sink.send(frame).await {
                        debug!(%peer, error = %err, "consumer write failed");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    counters.dropped.fetch_add(skipped, Ordering::Relaxed);
                    warn!(%peer, skipped, "slow consumer lost frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    counters.consumers.fetch_sub(1, Ordering::SeqCst);
    debug!(%peer, "consumer detached");
}
