//! Transform worker pool.

use crate::data::Document;
use crate::error::TransformError;
use crate::run::RunContext;
use crate::stage::{Pipeline, TransformResult};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::error;

/// Runs pipelines on a dedicated rayon pool so numeric work never blocks the
/// dispatch task.
pub struct TransformExecutor {
    pool: rayon::ThreadPool,
    pipeline: Arc<Pipeline>,
}

impl TransformExecutor {
    pub fn new(worker_count: usize, pipeline: Arc<Pipeline>) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_count)
            .thread_name(|i| format!("pdfstream-worker-{i}"))
            .panic_handler(|_| error!("transform worker panicked"))
            .build()?;
        Ok(Self { pool, pipeline })
    }

    pub fn worker_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Queue one event. The returned future resolves once the worker is done;
    /// a worker that dies without answering yields a `Worker` error.
    pub fn submit(
        &self,
        doc: Document,
        ctx: Arc<RunContext>,
    ) -> impl Future<Output = TransformResult> + Send + 'static {
        let (run_id, sequence_number) = (doc.run_id, doc.sequence_number);
        let (tx, rx) = oneshot::channel();
        let pipeline = Arc::clone(&self.pipeline);

        self.pool.spawn(move || {
            let result = pipeline.transform(doc, &ctx);
            let _ = tx.send(result);
        });

        async move {
            rx.await.unwrap_or_else(|_| TransformResult {
                run_id,
                sequence_number,
                outcome: Err(TransformError::Worker(
                    "worker exited before reporting a result".to_string(),
                )),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Calibration, Curve, DocumentKind, Geometry, ImageFrame};
    use crate::error::StageError;
    use crate::run::RunDefaults;
    use crate::stage::{Integrator, PipelineSettings, SineTransform};
    use ndarray::Array2;
    use serde_json::json;
    use uuid::Uuid;

    struct PanickingIntegrator;

    impl Integrator for PanickingIntegrator {
        fn integrate(&self, _: &Array2<f64>, _: &Geometry) -> Result<Curve, StageError> {
            panic!("integrator blew up")
        }
    }

    #[tokio::test]
    async fn test_submit_reports_failure() {
        let pipeline = Arc::new(Pipeline::with_defaults(&PipelineSettings::default()));
        let executor = TransformExecutor::new(2, pipeline).unwrap();
        let ctx = Arc::new(RunContext::new(Uuid::new_v4(), 0.0, &RunDefaults::default()));
        let doc = Document::new(DocumentKind::DataEvent, ctx.run_id, 4);

        let result = executor.submit(doc, ctx).await;
        assert_eq!(result.sequence_number, 4);
        assert!(matches!(result.outcome, Err(TransformError::Payload(_))));
        assert_eq!(executor.worker_count(), 2);
    }

    #[tokio::test]
    async fn test_worker_panic_is_worker_error() {
        let pipeline = Pipeline::new(
            &PipelineSettings::default(),
            Arc::new(PanickingIntegrator),
            Arc::new(SineTransform),
        );
        let executor = TransformExecutor::new(1, Arc::new(pipeline)).unwrap();
        let defaults = RunDefaults {
            calibration: Some(Calibration {
                distance: Some(0.2),
                poni1: Some(0.0),
                poni2: Some(0.0),
                pixel1: Some(2e-4),
                pixel2: Some(2e-4),
                wavelength: Some(1.8e-11),
                ..Default::default()
            }),
            ..Default::default()
        };
        let ctx = Arc::new(RunContext::new(Uuid::new_v4(), 0.0, &defaults));
        let doc = Document::new(DocumentKind::DataEvent, ctx.run_id, 6)
            .with_field("data", json!({"image": ImageFrame::uniform(48, 48, 10.0)}));

        let result = executor.submit(doc, ctx).await;
        let err = result.outcome.unwrap_err();
        assert!(matches!(err, TransformError::Worker(_)));
        assert_eq!(err.cause(), "WorkerError");
        assert_eq!(result.sequence_number, 6);
    }
}
