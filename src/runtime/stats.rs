//! Server counters shared between the dispatch task and handles.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ServerStats {
    pub(crate) frames_received: AtomicU64,
    pub(crate) malformed_frames: AtomicU64,
    pub(crate) ignored_documents: AtomicU64,
    pub(crate) runs_started: AtomicU64,
    pub(crate) runs_stopped: AtomicU64,
    pub(crate) events_submitted: AtomicU64,
    pub(crate) calibration_updates: AtomicU64,
    pub(crate) rejected_documents: AtomicU64,
    pub(crate) analyses_published: AtomicU64,
    pub(crate) errors_published: AtomicU64,
    pub(crate) encode_failures: AtomicU64,
    pub(crate) abandoned_transforms: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub malformed_frames: u64,
    pub ignored_documents: u64,
    pub runs_started: u64,
    pub runs_stopped: u64,
    pub events_submitted: u64,
    pub calibration_updates: u64,
    pub rejected_documents: u64,
    pub analyses_published: u64,
    pub errors_published: u64,
    pub encode_failures: u64,
    pub abandoned_transforms: u64,
}

impl ServerStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_received: load(&self.frames_received),
            malformed_frames: load(&self.malformed_frames),
            ignored_documents: load(&self.ignored_documents),
            runs_started: load(&self.runs_started),
            runs_stopped: load(&self.runs_stopped),
            events_submitted: load(&self.events_submitted),
            calibration_updates: load(&self.calibration_updates),
            rejected_documents: load(&self.rejected_documents),
            analyses_published: load(&self.analyses_published),
            errors_published: load(&self.errors_published),
            encode_failures: load(&self.encode_failures),
            abandoned_transforms: load(&self.abandoned_transforms),
        }
    }
}
