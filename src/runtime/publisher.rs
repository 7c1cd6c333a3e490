//! Turns outcomes into outbound `Analysis` and `Error` documents.

use super::scheduler::Outcome;
use super::stats::ServerStats;
use crate::data::{Document, DocumentKind, ErrorPayload};
use crate::error::{DocumentError, RelayError};
use crate::relay::DocumentSink;
use bytes::Bytes;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Emits exactly one document per transform result or rejection.
///
/// Outbound sequence numbers are counted per run from 0. Counters of runs that
/// are no longer live are kept for the `retain` most recent of them, so late
/// errors for a stopped run continue its numbering.
pub struct Publisher<S> {
    sink: S,
    counters: HashMap<Uuid, u64>,
    retired: VecDeque<Uuid>,
    retired_set: HashSet<Uuid>,
    retain: usize,
    stats: Arc<ServerStats>,
}

impl<S: DocumentSink> Publisher<S> {
    pub fn new(sink: S, retain: usize, stats: Arc<ServerStats>) -> Self {
        Self {
            sink,
            counters: HashMap::new(),
            retired: VecDeque::new(),
            retired_set: HashSet::new(),
            retain,
            stats,
        }
    }

    /// Publish one outcome. Only sink failures are returned.
    pub async fn publish(&mut self, outcome: Outcome) -> Result<(), RelayError> {
        match outcome {
            Outcome::Transform(result) => match result.outcome {
                Ok(analysis) => {
                    self.emit(result.run_id, DocumentKind::Analysis, &analysis)
                        .await
                }
                Err(err) => {
                    let payload = ErrorPayload {
                        event_sequence_number: result.sequence_number,
                        cause: err.cause().to_string(),
                        category: err.category().to_string(),
                        stage: err.stage().map(|s| s.name().to_string()),
                        message: err.to_string(),
                    };
                    self.emit(result.run_id, DocumentKind::Error, &payload)
                        .await
                }
            },
            Outcome::Rejected {
                run_id,
                sequence_number,
                error,
                retire,
            } => {
                let payload = ErrorPayload {
                    event_sequence_number: sequence_number,
                    cause: error.cause().to_string(),
                    category: error.category().to_string(),
                    stage: None,
                    message: error.to_string(),
                };
                let sent = self.emit(run_id, DocumentKind::Error, &payload).await;
                if retire {
                    self.retire(run_id);
                }
                sent
            }
            Outcome::Closed(run_id) => {
                self.retire(run_id);
                Ok(())
            }
            Outcome::Opened(run_id) => {
                self.revive(run_id);
                Ok(())
            }
        }
    }

    /// Outbound documents emitted so far for `run_id`.
    pub fn emitted(&self, run_id: Uuid) -> u64 {
        self.counters.get(&run_id).copied().unwrap_or(0)
    }

    async fn emit<T: Serialize>(
        &mut self,
        run_id: Uuid,
        kind: DocumentKind,
        payload: &T,
    ) -> Result<(), RelayError> {
        let counter = self.counters.entry(run_id).or_insert(0);
        let doc = Document::new(kind, run_id, *counter);
        let frame = match encode(doc, payload) {
            Ok(frame) => frame,
            Err(err) => {
                ServerStats::bump(&self.stats.encode_failures);
                warn!(%run_id, %kind, error = %err, "dropping unencodable document");
                return Ok(());
            }
        };
        *counter += 1;
        let sequence_number = *counter - 1;

        self.sink.send(frame).await?;
        match kind {
            DocumentKind::Analysis => ServerStats::bump(&self.stats.analyses_published),
            _ => ServerStats::bump(&self.stats.errors_published),
        }
        debug!(%run_id, %kind, sequence_number, "published");
        Ok(())
    }

    /// A restarted run keeps its numbering and is no longer eligible for eviction.
    fn revive(&mut self, run_id: Uuid) {
        if self.retired_set.remove(&run_id) {
            self.retired.retain(|id| *id != run_id);
        }
    }

    fn retire(&mut self, run_id: Uuid) {
        if self.retain == 0 {
            self.counters.remove(&run_id);
            return;
        }
        if !self.retired_set.insert(run_id) {
            return;
        }
        self.retired.push_back(run_id);
        while self.retired.len() > self.retain {
            if let Some(evicted) = self.retired.pop_front() {
                self.retired_set.remove(&evicted);
                self.counters.remove(&evicted);
            }
        }
    }
}

fn encode<T: Serialize>(doc: Document, payload: &T) -> Result<Bytes, DocumentError> {
    Ok(Bytes::from(doc.with_payload(payload)?.to_bytes()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{AnalysisPayload, DocumentBody};
    use crate::error::{RunError, StageError, TransformError};
    use crate::relay::{channel, ChannelSource, DocumentSource};
    use crate::stage::{StageId, TransformResult};

    fn publisher(retain: usize) -> (Publisher<crate::relay::ChannelSink>, ChannelSource) {
        let (sink, source) = channel(16);
        (Publisher::new(sink, retain, Arc::new(ServerStats::default())), source)
    }

    async fn next(source: &mut ChannelSource) -> Document {
        Document::from_bytes(&source.recv().await.unwrap().unwrap()).unwrap()
    }

    fn analysis(seq: u64) -> AnalysisPayload {
        AnalysisPayload {
            event_sequence_number: seq,
            q: vec![1.0],
            intensity: vec![2.0],
            fq_q: vec![],
            fq: vec![],
            chi_2theta: vec![0.5],
            chi_max: Some(2.0),
            chi_argmax: Some(1.0),
            sq: vec![],
            r: vec![0.0, 0.1],
            gr: vec![0.0, 0.0],
            gr_max: Some(0.0),
            gr_argmax: Some(0.0),
            stages: vec![],
        }
    }

    #[tokio::test]
    async fn test_sequence_numbers_per_run() {
        let (mut publisher, mut source) = publisher(8);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        for (run_id, seq) in [(a, 3), (b, 3), (a, 4)] {
            publisher
                .publish(Outcome::Transform(TransformResult {
                    run_id,
                    sequence_number: seq,
                    outcome: Ok(analysis(seq)),
                }))
                .await
                .unwrap();
        }

        let docs = [next(&mut source).await, next(&mut source).await, next(&mut source).await];
        assert_eq!((docs[0].run_id, docs[0].sequence_number), (a, 0));
        assert_eq!((docs[1].run_id, docs[1].sequence_number), (b, 0));
        assert_eq!((docs[2].run_id, docs[2].sequence_number), (a, 1));
        assert_eq!(docs[2].payload["event_sequence_number"], 4);
        assert!(matches!(docs[0].body().unwrap(), DocumentBody::Analysis));
    }

    #[tokio::test]
    async fn test_failure_becomes_error_document() {
        let (mut publisher, mut source) = publisher(8);
        let run_id = Uuid::new_v4();

        publisher
            .publish(Outcome::Transform(TransformResult {
                run_id,
                sequence_number: 9,
                outcome: Err(TransformError::Stage {
                    stage: StageId::Calibration,
                    source: StageError::Calibration("no wavelength".into()),
                }),
            }))
            .await
            .unwrap();

        let doc = next(&mut source).await;
        assert_eq!(doc.kind, DocumentKind::Error);
        let payload: ErrorPayload = serde_json::from_value(doc.payload.into()).unwrap();
        assert_eq!(payload.cause, "CalibrationError");
        assert_eq!(payload.stage.as_deref(), Some("calibration"));
        assert_eq!(payload.event_sequence_number, 9);
    }

    #[tokio::test]
    async fn test_numbering_survives_close() {
        let (mut publisher, mut source) = publisher(8);
        let run_id = Uuid::new_v4();

        publisher
            .publish(Outcome::Transform(TransformResult {
                run_id,
                sequence_number: 2,
                outcome: Ok(analysis(2)),
            }))
            .await
            .unwrap();
        publisher.publish(Outcome::Closed(run_id)).await.unwrap();
        publisher
            .publish(Outcome::Rejected {
                run_id,
                sequence_number: 5,
                error: RunError::ClosedRun(run_id),
                retire: true,
            })
            .await
            .unwrap();

        assert_eq!(next(&mut source).await.sequence_number, 0);
        let late = next(&mut source).await;
        assert_eq!(late.sequence_number, 1);
        assert_eq!(late.payload["cause"], "ClosedRunError");
    }

    #[tokio::test]
    async fn test_retired_counters_are_bounded() {
        let (mut publisher, _source) = publisher(1);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        for run_id in [a, b] {
            publisher
                .publish(Outcome::Rejected {
                    run_id,
                    sequence_number: 0,
                    error: RunError::UnknownRun(run_id),
                    retire: true,
                })
                .await
                .unwrap();
        }

        assert_eq!(publisher.emitted(a), 0);
        assert_eq!(publisher.emitted(b), 1);
    }

    #[tokio::test]
    async fn test_restarted_run_is_not_evicted() {
        let (mut publisher, mut source) = publisher(1);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let event = |run_id, seq| {
            Outcome::Transform(TransformResult {
                run_id,
                sequence_number: seq,
                outcome: Ok(analysis(seq)),
            })
        };

        publisher.publish(event(a, 0)).await.unwrap();
        publisher.publish(Outcome::Closed(a)).await.unwrap();
        publisher.publish(Outcome::Opened(a)).await.unwrap();
        publisher.publish(event(b, 0)).await.unwrap();
        publisher.publish(Outcome::Closed(b)).await.unwrap();
        publisher.publish(event(a, 1)).await.unwrap();

        let seqs: Vec<_> = [
            next(&mut source).await,
            next(&mut source).await,
            next(&mut source).await,
        ]
        .iter()
        .map(|doc| (doc.run_id, doc.sequence_number))
        .collect();
        assert_eq!(seqs, vec![(a, 0), (b, 0), (a, 1)]);
        assert_eq!(publisher.emitted(a), 2);
    }
}
