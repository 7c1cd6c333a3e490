//! Server runtime: dispatch loop, worker pool and publication.

pub mod executor;
pub mod publisher;
pub mod scheduler;
pub mod server;
pub mod stats;

pub use executor::TransformExecutor;
pub use publisher::Publisher;
pub use scheduler::{InFlightQueue, Outcome};
pub use server::{Server, ServerHandle, ServerState};
pub use stats::{ServerStats, StatsSnapshot};
