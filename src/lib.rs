//! pdfstream - streaming diffraction-image to PDF document server.
//!
//! This crate consumes a live stream of acquisition documents keyed by run,
//! turns every raw detector image into a pair distribution function and
//! republishes the results on a fan-out relay:
//!
//! - Length-delimited TCP relay with drop-oldest per-consumer buffers
//! - Per-run state tracking across interleaved runs
//! - Ordered numeric stage chain executed on a rayon pool
//! - Exactly one `Analysis` or `Error` document per inbound event, in order
//!
//! # Architecture
//!
//! ```text
//!  producers ──► backend ┌───────────┐ frontend ──► consumers
//!                        │   Relay   │
//!                        └───────────┘
//!                          ▲       │
//!              Analysis /  │       │  RunStart / Descriptor /
//!              Error docs  │       ▼  DataEvent / RunStop
//! ┌────────────────────────────────────────────────┐
//! │                    Server                      │
//! │  ┌────────────┐  ┌─────────────┐  ┌─────────┐  │
//! │  │ RunTracker │─►│ InFlight    │─►│Publisher│  │
//! │  │ (contexts) │  │ (FIFO)      │  │         │  │
//! │  └────────────┘  └─────────────┘  └─────────┘  │
//! │         │               ▲                      │
//! │         ▼               │                      │
//! │  ┌──────────────────────────────┐              │
//! │  │ Pipeline on rayon workers    │              │
//! │  │ dark ► mask ► calibration ►  │              │
//! │  │ integration ► F(Q) ► G(r)    │              │
//! │  └──────────────────────────────┘              │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use pdfstream::{Config, Relay, Server};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load(None)?;
//! pdfstream::telemetry::init_tracing(&config.log)?;
//!
//! let relay = Relay::bind(&config.relay).await?.spawn()?;
//! let server = Server::from_config(&config)?;
//! let handle = server.handle();
//! tokio::spawn(async move { server.start().await });
//!
//! // ... later
//! handle.stop().await;
//! relay.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod relay;
pub mod run;
pub mod runtime;
pub mod stage;
pub mod telemetry;

// Re-export commonly used items
pub use config::Config;
pub use data::{AnalysisPayload, Document, DocumentKind, ErrorPayload};
pub use error::{ConfigError, RelayError, RunError, ServerError, StageError, TransformError};
pub use relay::{DocumentSink, DocumentSource, Relay, RelayHandle};
pub use run::{RunContext, RunTracker};
pub use runtime::{Server, ServerHandle, ServerState, StatsSnapshot};
pub use stage::{Pipeline, PipelineSettings, Stage, StageId};
