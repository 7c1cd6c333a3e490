//! The fixed stage chain applied to every data event.

use super::calibrate::CalibrationStage;
use super::dark::DarkSubtractionStage;
use super::integrate::{HistogramIntegrator, IntegrationSettings, IntegrationStage, Integrator};
use super::mask::{MaskSettings, MaskStage};
use super::pdf::{GridSettings, PdfStage, PdfTransformer, SineTransform};
use super::structure::{StructureFunctionStage, StructureSettings};
use super::traits::{Frame, Stage, StageId, WorkItem};
use crate::data::{AnalysisPayload, Document, DocumentBody, DocumentKind};
use crate::error::{StageError, TransformError};
use crate::run::RunContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Numeric settings for every stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub mask: MaskSettings,
    pub integration: IntegrationSettings,
    pub structure: StructureSettings,
    pub grid: GridSettings,
}

impl PipelineSettings {
    /// Overlay a run's `user_config` on these settings.
    ///
    /// Only the `mask`, `structure` and `grid` sections may be overridden;
    /// fields a section leaves out keep their current value.
    pub fn with_user_config(&self, user_config: &Value) -> Result<PipelineSettings, String> {
        let overrides = user_config
            .as_object()
            .ok_or_else(|| "user_config must be a mapping".to_string())?;
        let mut merged = serde_json::to_value(self).map_err(|e| e.to_string())?;
        for (section, fields) in overrides {
            if !matches!(section.as_str(), "mask" | "structure" | "grid") {
                return Err(format!("user_config section '{section}' cannot be overridden per run"));
            }
            let fields = fields
                .as_object()
                .ok_or_else(|| format!("user_config section '{section}' must be a mapping"))?;
            // Sigma clipping belongs to the server's integrator.
            if section == "mask" && fields.contains_key("alpha") {
                return Err("mask.alpha cannot be overridden per run".to_string());
            }
            if let Some(Value::Object(current)) = merged.get_mut(section) {
                current.extend(fields.clone());
            }
        }
        let settings: PipelineSettings =
            serde_json::from_value(merged).map_err(|e| format!("invalid user_config: {e}"))?;
        settings.grid.validate()?;
        settings.structure.validate()?;
        Ok(settings)
    }
}

/// Outcome of one data event.
#[derive(Debug, Clone)]
pub struct TransformResult {
    pub run_id: Uuid,
    pub sequence_number: u64,
    pub outcome: Result<AnalysisPayload, TransformError>,
}

/// Ordered stages: dark subtraction, mask, calibration, integration,
/// structure function, PDF transform.
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    /// Build the chain with injected numeric strategies.
    pub fn new(
        settings: &PipelineSettings,
        integrator: Arc<dyn Integrator>,
        transformer: Arc<dyn PdfTransformer>,
    ) -> Self {
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(DarkSubtractionStage),
            Arc::new(MaskStage::new(settings.mask.clone())),
            Arc::new(CalibrationStage),
            Arc::new(IntegrationStage::new(integrator)),
            Arc::new(StructureFunctionStage::new(settings.structure.clone())),
            Arc::new(PdfStage::new(&settings.grid, transformer)),
        ];
        Self { stages }
    }

    /// Build the chain with the histogram integrator and the sine transform.
    pub fn with_defaults(settings: &PipelineSettings) -> Self {
        let integrator = HistogramIntegrator::new(settings.integration.npt, settings.mask.alpha);
        Self::new(settings, Arc::new(integrator), Arc::new(SineTransform))
    }

    pub fn stage_ids(&self) -> Vec<StageId> {
        self.stages.iter().map(|s| s.id()).collect()
    }

    /// Run every enabled stage, stopping at the first failure.
    pub fn run(&self, mut work: WorkItem, ctx: &RunContext) -> Result<WorkItem, TransformError> {
        for stage in &self.stages {
            if !stage.is_enabled(ctx) {
                continue;
            }
            work = stage
                .process(work, ctx)
                .map_err(|source| TransformError::Stage {
                    stage: stage.id(),
                    source,
                })?;
            work.applied.push(stage.id());
        }
        Ok(work)
    }

    /// Transform one `DataEvent` document.
    pub fn transform(&self, doc: Document, ctx: &RunContext) -> TransformResult {
        let (run_id, sequence_number) = (doc.run_id, doc.sequence_number);
        let outcome = self.analyse(doc, ctx);
        match &outcome {
            Ok(_) => debug!(%run_id, sequence_number, "event transformed"),
            Err(err) => debug!(%run_id, sequence_number, error = %err, "event failed"),
        }
        TransformResult {
            run_id,
            sequence_number,
            outcome,
        }
    }

    fn analyse(&self, doc: Document, ctx: &RunContext) -> Result<AnalysisPayload, TransformError> {
        let (run_id, sequence_number) = (doc.run_id, doc.sequence_number);
        let event = match doc
            .into_body()
            .map_err(|e| TransformError::Payload(e.to_string()))?
        {
            DocumentBody::DataEvent(event) => event,
            _ => {
                return Err(TransformError::Payload(format!(
                    "expected a {} document",
                    DocumentKind::DataEvent
                )))
            }
        };
        let image = event
            .image(&ctx.image_key)
            .and_then(|frame| frame.to_array())
            .map_err(TransformError::Payload)?;

        let work = WorkItem::new(run_id, sequence_number, image)
            .with_exposure_time(event.exposure_time());
        into_analysis(self.run(work, ctx)?)
    }
}

fn into_analysis(work: WorkItem) -> Result<AnalysisPayload, TransformError> {
    let gr = match work.frame {
        Frame::Pdf(gr) => gr,
        other => {
            return Err(TransformError::Stage {
                stage: StageId::PdfTransform,
                source: StageError::Precondition(format!(
                    "pipeline ended with {} instead of a PDF",
                    other.kind()
                )),
            })
        }
    };
    let pattern = work.pattern.unwrap_or_default();
    let structure = work.structure.unwrap_or_default();
    let chi_2theta = match &work.geometry {
        Some(geometry) => pattern.x.iter().map(|&q| geometry.two_theta_deg(q)).collect(),
        None => vec![f64::NAN; pattern.len()],
    };
    let sq = structure
        .x
        .iter()
        .zip(structure.y.iter())
        .map(|(&q, &f)| if q > 0.0 { 1.0 + f / q } else { f64::NAN })
        .collect();
    let (chi_argmax, chi_max) = pattern.peak().unzip();
    let (gr_argmax, gr_max) = gr.peak().unzip();
    Ok(AnalysisPayload {
        event_sequence_number: work.sequence_number,
        chi_2theta,
        chi_max,
        chi_argmax,
        sq,
        gr_max,
        gr_argmax,
        q: pattern.x,
        intensity: pattern.y,
        fq_q: structure.x,
        fq: structure.y,
        r: gr.x,
        gr: gr.y,
        stages: work.applied.iter().map(|s| s.name().to_string()).collect(),
    })
}
