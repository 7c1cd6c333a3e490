//! Ordered in-flight queue.
//!
//! Every outbound effect of an inbound document is pushed here in arrival
//! order, whether it is a running transform or an immediate rejection, and is
//! popped in that same order. Completion order therefore never reorders the
//! outbound stream of a run.
//!
//! Transforms already run on the worker pool when they are queued; the queue
//! only ever waits on its head.

use crate::error::{RunError, TransformError};
use crate::stage::TransformResult;
use futures::future::{BoxFuture, FutureExt};
use std::collections::VecDeque;
use std::future::Future;
use uuid::Uuid;

/// What the publisher should do, in order.
#[derive(Debug)]
pub enum Outcome {
    /// A finished transform.
    Transform(TransformResult),
    /// A document rejected by the run tracker.
    Rejected {
        run_id: Uuid,
        sequence_number: u64,
        error: RunError,
        /// The run is not live, so its outbound numbering can be retired.
        retire: bool,
    },
    /// The run was stopped or aborted.
    Closed(Uuid),
    /// The run was (re)started; its outbound numbering must stay live.
    Opened(Uuid),
}

enum Slot {
    Ready(Outcome),
    Transform {
        run_id: Uuid,
        sequence_number: u64,
        result: BoxFuture<'static, TransformResult>,
    },
}

/// FIFO of pending outcomes.
pub struct InFlightQueue {
    slots: VecDeque<Slot>,
    transforms: usize,
}

impl InFlightQueue {
    pub fn new() -> Self {
        Self {
            slots: VecDeque::new(),
            transforms: 0,
        }
    }

    /// Enqueue a running transform for event `sequence_number` of `run_id`.
    pub fn push_transform<F>(&mut self, run_id: Uuid, sequence_number: u64, transform: F)
    where
        F: Future<Output = TransformResult> + Send + 'static,
    {
        self.transforms += 1;
        self.slots.push_back(Slot::Transform {
            run_id,
            sequence_number,
            result: transform.boxed(),
        });
    }

    /// Enqueue an outcome that is already known.
    pub fn push_ready(&mut self, outcome: Outcome) {
        self.slots.push_back(Slot::Ready(outcome));
    }

    /// The next outcome in arrival order; `None` when empty.
    ///
    /// Cancel safe: dropping the returned future leaves the head in place.
    pub async fn next(&mut self) -> Option<Outcome> {
        let head = self.slots.front_mut()?;
        if let Slot::Transform { result, .. } = &mut *head {
            let done = result.as_mut().await;
            *head = Slot::Ready(Outcome::Transform(done));
            self.transforms -= 1;
        }
        match self.slots.pop_front() {
            Some(Slot::Ready(outcome)) => Some(outcome),
            _ => None,
        }
    }

    /// Empty the queue without waiting.
    ///
    /// Ready outcomes and transforms that have already finished are returned
    /// as they are. Unfinished transforms are returned as `Abandoned`
    /// failures. The second value is the number of abandoned transforms.
    pub fn abandon(&mut self) -> (Vec<Outcome>, usize) {
        let mut abandoned = 0;
        let outcomes = self
            .slots
            .drain(..)
            .map(|slot| match slot {
                Slot::Ready(outcome) => outcome,
                Slot::Transform {
                    run_id,
                    sequence_number,
                    mut result,
                } => Outcome::Transform(result.as_mut().now_or_never().unwrap_or_else(|| {
                    abandoned += 1;
                    TransformResult {
                        run_id,
                        sequence_number,
                        outcome: Err(TransformError::Abandoned),
                    }
                })),
            })
            .collect();
        self.transforms = 0;
        (outcomes, abandoned)
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Get the number of pending outcomes.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Pending outcomes that are transforms.
    pub fn transforms(&self) -> usize {
        self.transforms
    }
}

impl Default for InFlightQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn result(seq: u64) -> TransformResult {
        TransformResult {
            run_id: Uuid::nil(),
            sequence_number: seq,
            outcome: Err(TransformError::Worker("test".into())),
        }
    }

    fn sequence(outcome: &Outcome) -> u64 {
        match outcome {
            Outcome::Transform(r) => r.sequence_number,
            Outcome::Rejected { sequence_number, .. } => *sequence_number,
            Outcome::Closed(_) | Outcome::Opened(_) => u64::MAX,
        }
    }

    fn unknown(seq: u64) -> Outcome {
        Outcome::Rejected {
            run_id: Uuid::nil(),
            sequence_number: seq,
            error: RunError::UnknownRun(Uuid::nil()),
            retire: true,
        }
    }

    #[tokio::test]
    async fn test_arrival_order_preserved() {
        let mut queue = InFlightQueue::new();
        queue.push_transform(Uuid::nil(), 0, async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            result(0)
        });
        queue.push_ready(unknown(1));
        queue.push_transform(Uuid::nil(), 2, async { result(2) });
        queue.push_ready(Outcome::Closed(Uuid::nil()));

        assert_eq!(queue.len(), 4);
        assert_eq!(queue.transforms(), 2);

        let mut order = Vec::new();
        while let Some(outcome) = queue.next().await {
            order.push(sequence(&outcome));
        }
        assert_eq!(order, vec![0, 1, 2, u64::MAX]);
        assert_eq!(queue.transforms(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_next_keeps_head() {
        let mut queue = InFlightQueue::new();
        queue.push_transform(Uuid::nil(), 0, async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            result(0)
        });

        let early = tokio::time::timeout(Duration::from_millis(5), queue.next()).await;
        assert!(early.is_err());
        assert_eq!(queue.len(), 1);

        let outcome = queue.next().await.unwrap();
        assert_eq!(sequence(&outcome), 0);
    }

    #[tokio::test]
    async fn test_abandon_keeps_ready_outcomes() {
        let mut queue = InFlightQueue::new();
        queue.push_transform(Uuid::nil(), 0, futures::future::pending::<TransformResult>());
        queue.push_ready(unknown(1));
        queue.push_transform(Uuid::nil(), 2, async { result(2) });

        let (outcomes, abandoned) = queue.abandon();

        assert_eq!(abandoned, 1);
        assert!(queue.is_empty());
        assert_eq!(outcomes.iter().map(sequence).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(matches!(
            &outcomes[0],
            Outcome::Transform(TransformResult { outcome: Err(TransformError::Abandoned), .. })
        ));
        assert!(matches!(
            &outcomes[2],
            Outcome::Transform(TransformResult { outcome: Err(TransformError::Worker(_)), .. })
        ));
    }
}
