//! Run state machine.
//!
//! One [`RunTracker`] per server. It is owned by the dispatch task, so every
//! mutation is serialised without locks; transforms only ever see
//! `Arc<RunContext>` snapshots handed out by [`RunTracker::on_data_event`].

use super::context::{RunConfigView, RunContext, RunDefaults, RunPhase, RunSummary};
use crate::data::{Document, DocumentBody, DocumentKind, RunStopPayload};
use crate::error::RunError;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

/// Default number of stopped run ids remembered.
pub const DEFAULT_CLOSED_RUN_MEMORY: usize = 1024;

struct RunEntry {
    context: Arc<RunContext>,
    events_accepted: u64,
}

impl RunEntry {
    fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.context.run_id,
            phase: self.context.phase,
            events_accepted: self.events_accepted,
            descriptors: self.context.descriptors,
            started_at: self.context.started_at,
        }
    }
}

/// Bounded FIFO memory of stopped runs.
struct ClosedRuns {
    order: VecDeque<Uuid>,
    members: HashSet<Uuid>,
    capacity: usize,
}

impl ClosedRuns {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity,
        }
    }

    fn insert(&mut self, run_id: Uuid) {
        if self.capacity == 0 || !self.members.insert(run_id) {
            return;
        }
        self.order.push_back(run_id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
    }

    fn remove(&mut self, run_id: &Uuid) {
        if self.members.remove(run_id) {
            self.order.retain(|id| id != run_id);
        }
    }

    fn contains(&self, run_id: &Uuid) -> bool {
        self.members.contains(run_id)
    }
}

/// Where an accepted data event goes.
#[derive(Debug)]
pub enum EventRoute {
    /// Transform the event with this context snapshot.
    Transform(Arc<RunContext>),
    /// The event carried calibration values and has been merged into the run.
    Calibration,
}

impl EventRoute {
    pub fn into_context(self) -> Option<Arc<RunContext>> {
        match self {
            EventRoute::Transform(ctx) => Some(ctx),
            EventRoute::Calibration => None,
        }
    }
}

/// Tracks live runs and their accumulated configuration.
pub struct RunTracker {
    live: HashMap<Uuid, RunEntry>,
    closed: ClosedRuns,
    defaults: RunDefaults,
}

impl RunTracker {
    pub fn new(defaults: RunDefaults, closed_run_memory: usize) -> Self {
        Self {
            live: HashMap::new(),
            closed: ClosedRuns::new(closed_run_memory),
            defaults,
        }
    }

    /// Open a run.
    ///
    /// A live duplicate is rejected and left untouched. A recently stopped id
    /// may be opened again.
    pub fn on_run_start(&mut self, doc: Document) -> Result<(), RunError> {
        let run_id = doc.run_id;
        if self.live.contains_key(&run_id) {
            return Err(RunError::DuplicateRun(run_id));
        }
        let started_at = doc.timestamp;
        let start = match doc.into_body()? {
            DocumentBody::RunStart(start) => start,
            _ => return Err(wrong_kind(run_id, DocumentKind::RunStart)),
        };

        let mut context = RunContext::new(run_id, started_at, &self.defaults);
        context.sample_name = start.sample_name;
        context
            .apply_settings(&start.settings)
            .map_err(|reason| RunError::InvalidSettings { run_id, reason })?;
        if let Some(user_config) = &start.user_config {
            context
                .apply_user_config(&self.defaults.pipeline, user_config)
                .map_err(|reason| RunError::InvalidSettings { run_id, reason })?;
        }

        self.closed.remove(&run_id);
        self.live.insert(
            run_id,
            RunEntry {
                context: Arc::new(context),
                events_accepted: 0,
            },
        );
        Ok(())
    }

    /// Merge a descriptor into the live context.
    pub fn on_descriptor(&mut self, doc: Document) -> Result<(), RunError> {
        let run_id = doc.run_id;
        let entry = self.live_entry(run_id)?;
        let descriptor = match doc.into_body()? {
            DocumentBody::Descriptor(descriptor) => descriptor,
            _ => return Err(wrong_kind(run_id, DocumentKind::Descriptor)),
        };

        // Validate against a scratch copy so a bad descriptor leaves the run as it was.
        let mut context = RunContext::clone(&entry.context);
        context
            .apply_settings(&descriptor.settings)
            .map_err(|reason| RunError::InvalidSettings { run_id, reason })?;
        if descriptor.is_calibration_stream() {
            context.calibration_streams.extend(descriptor.uid.clone());
            context.calibration_streams.insert(descriptor.name.clone());
        } else {
            if let Some(key) = descriptor.image_key() {
                context.image_key = key.to_string();
            }
            context.data_keys.extend(descriptor.data_keys);
        }
        context.descriptors += 1;
        context.phase = RunPhase::Described;

        entry.context = Arc::new(context);
        Ok(())
    }

    /// Route a data event.
    ///
    /// Image events get the context snapshot they should be transformed with.
    /// Events of a calibration stream update the run's calibration instead.
    pub fn on_data_event(&mut self, doc: &Document) -> Result<EventRoute, RunError> {
        let run_id = doc.run_id;
        let entry = self.live_entry(run_id)?;
        if entry.context.phase == RunPhase::Started {
            return Err(RunError::OutOfOrder {
                run_id,
                kind: DocumentKind::DataEvent,
                reason: "no descriptor received yet",
            });
        }
        let descriptor = doc.payload.get("descriptor").and_then(Value::as_str);
        if !entry.context.is_calibration_stream(descriptor) {
            entry.events_accepted += 1;
            return Ok(EventRoute::Transform(Arc::clone(&entry.context)));
        }

        let event = match doc.body()? {
            DocumentBody::DataEvent(event) => event,
            _ => return Err(wrong_kind(run_id, DocumentKind::DataEvent)),
        };
        let update = event
            .calibration()
            .map_err(|reason| RunError::InvalidSettings { run_id, reason })?;
        let mut context = RunContext::clone(&entry.context);
        match &mut context.calibration {
            Some(current) => current.merge(&update),
            None => context.calibration = Some(update),
        }
        entry.context = Arc::new(context);
        Ok(EventRoute::Calibration)
    }

    /// Close a run. In-flight transforms keep their snapshot.
    pub fn on_run_stop(&mut self, doc: Document) -> Result<(RunSummary, RunStopPayload), RunError> {
        let run_id = doc.run_id;
        self.live_entry(run_id)?;
        // A malformed stop still closes the run.
        let stop = match doc.into_body() {
            Ok(DocumentBody::RunStop(stop)) => stop,
            _ => RunStopPayload::default(),
        };
        let summary = self.close(run_id).ok_or(RunError::UnknownRun(run_id))?;
        Ok((summary, stop))
    }

    /// Destroy a live run without a stop document.
    pub fn abort(&mut self, run_id: Uuid) -> Option<RunSummary> {
        self.close(run_id)
    }

    pub fn active_runs(&self) -> Vec<RunSummary> {
        let mut runs: Vec<_> = self.live.values().map(RunEntry::summary).collect();
        runs.sort_by(|a, b| a.started_at.total_cmp(&b.started_at));
        runs
    }

    pub fn run_config(&self, run_id: Uuid) -> Option<RunConfigView> {
        self.live
            .get(&run_id)
            .map(|entry| entry.context.config_view())
    }

    pub fn is_live(&self, run_id: Uuid) -> bool {
        self.live.contains_key(&run_id)
    }

    pub fn is_closed(&self, run_id: Uuid) -> bool {
        self.closed.contains(&run_id)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn live_entry(&mut self, run_id: Uuid) -> Result<&mut RunEntry, RunError> {
        if self.closed.contains(&run_id) {
            return Err(RunError::ClosedRun(run_id));
        }
        self.live.get_mut(&run_id).ok_or(RunError::UnknownRun(run_id))
    }

    fn close(&mut self, run_id: Uuid) -> Option<RunSummary> {
        let entry = self.live.remove(&run_id)?;
        self.closed.insert(run_id);
        Some(entry.summary())
    }
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new(RunDefaults::default(), DEFAULT_CLOSED_RUN_MEMORY)
    }
}

fn wrong_kind(run_id: Uuid, expected: DocumentKind) -> RunError {
    RunError::OutOfOrder {
        run_id,
        kind: expected,
        reason: "payload does not match document kind",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataKey, DescriptorPayload, ImageFrame, MaskFrame};
    use serde_json::json;

    fn start(run_id: Uuid) -> Document {
        Document::new(DocumentKind::RunStart, run_id, 0).with_field("sample_name", "Ni")
    }

    fn descriptor(run_id: Uuid) -> Document {
        let mut payload = DescriptorPayload::default();
        payload
            .data_keys
            .insert("pe1_image".into(), DataKey::image(4, 4));
        Document::new(DocumentKind::Descriptor, run_id, 1)
            .with_payload(&payload)
            .unwrap()
    }

    fn event(run_id: Uuid, seq: u64) -> Document {
        Document::new(DocumentKind::DataEvent, run_id, seq)
            .with_field("data", json!({"pe1_image": ImageFrame::uniform(4, 4, 1.0)}))
    }

    fn stop(run_id: Uuid) -> Document {
        Document::new(DocumentKind::RunStop, run_id, 9).with_field("exit_status", "success")
    }

    fn transform_context(route: Result<EventRoute, RunError>) -> Arc<RunContext> {
        route.unwrap().into_context().expect("image event")
    }

    #[test]
    fn test_lifecycle() {
        let mut tracker = RunTracker::default();
        let run = Uuid::new_v4();

        tracker.on_run_start(start(run)).unwrap();
        tracker.on_descriptor(descriptor(run)).unwrap();
        let ctx = transform_context(tracker.on_data_event(&event(run, 2)));
        assert_eq!(ctx.image_key, "pe1_image");
        assert_eq!(ctx.sample_name.as_deref(), Some("Ni"));

        let (summary, payload) = tracker.on_run_stop(stop(run)).unwrap();
        assert_eq!(summary.events_accepted, 1);
        assert_eq!(summary.descriptors, 1);
        assert_eq!(payload.exit_status, crate::data::ExitStatus::Success);
        assert!(tracker.is_empty());

        // Snapshot survives the stop.
        assert_eq!(ctx.run_id, run);
    }

    #[test]
    fn test_duplicate_start_leaves_run_untouched() {
        let mut tracker = RunTracker::default();
        let run = Uuid::new_v4();
        tracker.on_run_start(start(run)).unwrap();
        tracker.on_descriptor(descriptor(run)).unwrap();

        let err = tracker.on_run_start(start(run)).unwrap_err();
        assert!(matches!(err, RunError::DuplicateRun(id) if id == run));

        let runs = tracker.active_runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].phase, RunPhase::Described);
    }

    #[test]
    fn test_unknown_and_closed() {
        let mut tracker = RunTracker::default();
        let run = Uuid::new_v4();

        let err = tracker.on_data_event(&event(run, 0)).unwrap_err();
        assert_eq!(err.cause(), "UnknownRunError");

        tracker.on_run_start(start(run)).unwrap();
        tracker.on_descriptor(descriptor(run)).unwrap();
        tracker.on_run_stop(stop(run)).unwrap();

        let err = tracker.on_data_event(&event(run, 5)).unwrap_err();
        assert_eq!(err.cause(), "ClosedRunError");
        let err = tracker.on_descriptor(descriptor(run)).unwrap_err();
        assert_eq!(err.cause(), "ClosedRunError");
        let err = tracker.on_run_stop(stop(run)).unwrap_err();
        assert_eq!(err.cause(), "ClosedRunError");
    }

    #[test]
    fn test_event_before_descriptor() {
        let mut tracker = RunTracker::default();
        let run = Uuid::new_v4();
        tracker.on_run_start(start(run)).unwrap();

        let err = tracker.on_data_event(&event(run, 1)).unwrap_err();
        assert!(matches!(err, RunError::OutOfOrder { .. }));
        assert_eq!(err.cause(), "ProtocolError");
    }

    #[test]
    fn test_snapshot_isolated_from_descriptor() {
        let mut tracker = RunTracker::default();
        let run = Uuid::new_v4();
        tracker.on_run_start(start(run)).unwrap();
        tracker.on_descriptor(descriptor(run)).unwrap();
        let before = transform_context(tracker.on_data_event(&event(run, 2)));

        let update = Document::new(DocumentKind::Descriptor, run, 3).with_field("bg_scale", 0.25);
        tracker.on_descriptor(update).unwrap();
        let after = transform_context(tracker.on_data_event(&event(run, 4)));

        assert_eq!(before.background_scale, 1.0);
        assert_eq!(after.background_scale, 0.25);
        assert_eq!(after.descriptors, 2);
    }

    #[test]
    fn test_bad_descriptor_keeps_context() {
        let mut tracker = RunTracker::default();
        let run = Uuid::new_v4();
        tracker.on_run_start(start(run)).unwrap();

        let bad_mask = MaskFrame {
            shape: [2, 2],
            data: vec![0; 3],
        };
        let doc = Document::new(DocumentKind::Descriptor, run, 1)
            .with_field("mask", serde_json::to_value(bad_mask).unwrap());
        let err = tracker.on_descriptor(doc).unwrap_err();

        assert!(matches!(err, RunError::InvalidSettings { .. }));
        assert_eq!(tracker.active_runs()[0].phase, RunPhase::Started);
    }

    #[test]
    fn test_overlapping_runs() {
        let mut tracker = RunTracker::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        for run in [a, b] {
            tracker.on_run_start(start(run)).unwrap();
            tracker.on_descriptor(descriptor(run)).unwrap();
        }
        tracker.on_run_stop(stop(a)).unwrap();

        assert!(tracker.on_data_event(&event(b, 2)).is_ok());
        assert!(tracker.is_closed(a));
        assert!(tracker.is_live(b));
    }

    #[test]
    fn test_closed_memory_is_bounded() {
        let mut tracker = RunTracker::new(RunDefaults::default(), 2);
        let runs: Vec<_> = (0..3).map(|_| Uuid::new_v4()).collect();
        for &run in &runs {
            tracker.on_run_start(start(run)).unwrap();
            tracker.abort(run);
        }

        assert!(!tracker.is_closed(runs[0]));
        assert!(tracker.is_closed(runs[1]));
        assert!(tracker.is_closed(runs[2]));
        let err = tracker.on_data_event(&event(runs[0], 1)).unwrap_err();
        assert_eq!(err.cause(), "UnknownRunError");
    }

    #[test]
    fn test_restart_after_stop() {
        let mut tracker = RunTracker::default();
        let run = Uuid::new_v4();
        tracker.on_run_start(start(run)).unwrap();
        tracker.abort(run);

        tracker.on_run_start(start(run)).unwrap();
        assert!(tracker.is_live(run));
        assert!(!tracker.is_closed(run));
    }

    #[test]
    fn test_run_config_view() {
        let mut tracker = RunTracker::default();
        let run = Uuid::new_v4();
        tracker.on_run_start(start(run)).unwrap();
        tracker.on_descriptor(descriptor(run)).unwrap();

        let view = tracker.run_config(run).unwrap();
        assert_eq!(view.image_key, "pe1_image");
        assert!(view.data_keys.contains_key("pe1_image"));
        assert!(tracker.run_config(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_user_config_on_start() {
        let mut tracker = RunTracker::default();
        let run = Uuid::new_v4();
        let doc = start(run).with_field("user_config", json!({"structure": {"qmax": 18.0}}));

        tracker.on_run_start(doc).unwrap();
        tracker.on_descriptor(descriptor(run)).unwrap();
        let ctx = transform_context(tracker.on_data_event(&event(run, 2)));
        assert_eq!(ctx.overrides.as_ref().unwrap().structure.qmax, 18.0);

        let other = Uuid::new_v4();
        let bad = start(other).with_field("user_config", json!({"grid": {"rstep": 0.0}}));
        let err = tracker.on_run_start(bad).unwrap_err();
        assert!(matches!(err, RunError::InvalidSettings { .. }));
        assert!(!tracker.is_live(other));
    }

    #[test]
    fn test_calibration_stream_updates_run() {
        let mut tracker = RunTracker::default();
        let run = Uuid::new_v4();
        tracker.on_run_start(start(run)).unwrap();
        tracker.on_descriptor(descriptor(run)).unwrap();
        let calib = Document::new(DocumentKind::Descriptor, run, 2)
            .with_field("uid", "calib-1")
            .with_field("name", "calib");
        tracker.on_descriptor(calib).unwrap();

        let before = transform_context(tracker.on_data_event(&event(run, 3)));
        let update = Document::new(DocumentKind::DataEvent, run, 4)
            .with_field("descriptor", "calib-1")
            .with_field("data", json!({"pe1c_dist": 0.25, "pe1c_wavelength": 1.8e-11}));
        let route = tracker.on_data_event(&update).unwrap();
        assert!(matches!(route, EventRoute::Calibration));

        let after = transform_context(tracker.on_data_event(&event(run, 5)));
        assert!(before.calibration.is_none());
        assert_eq!(after.calibration.as_ref().unwrap().distance, Some(0.25));
        assert_eq!(after.image_key, "pe1_image");
        assert_eq!(tracker.active_runs()[0].events_accepted, 2);

        let garbage = Document::new(DocumentKind::DataEvent, run, 6)
            .with_field("descriptor", "calib")
            .with_field("data", json!({"pe1c_dist": "far"}));
        let err = tracker.on_data_event(&garbage).unwrap_err();
        assert_eq!(err.cause(), "ProtocolError");
    }
}
