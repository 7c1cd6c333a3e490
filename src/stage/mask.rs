//! Pixel masking: run mask plus automatic edge and threshold masking.

use super::traits::{Stage, StageId, WorkItem};
use crate::error::StageError;
use crate::run::RunContext;
use serde::{Deserialize, Serialize};

/// Automatic masking settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskSettings {
    /// Width in pixels of the masked detector border.
    pub edge: usize,
    /// Pixels below this value are masked.
    pub lower_thresh: Option<f64>,
    /// Pixels above this value are masked.
    pub upper_thresh: Option<f64>,
    /// Sigma-clipping factor used during integration; `None` disables it.
    pub alpha: Option<f64>,
}

impl Default for MaskSettings {
    fn default() -> Self {
        Self {
            edge: 20,
            lower_thresh: Some(0.0),
            upper_thresh: None,
            alpha: Some(2.5),
        }
    }
}

impl MaskSettings {
    /// No automatic masking at all.
    pub fn disabled() -> Self {
        Self {
            edge: 0,
            lower_thresh: None,
            upper_thresh: None,
            alpha: None,
        }
    }
}

/// Sets excluded pixels to NaN.
#[derive(Debug, Default)]
pub struct MaskStage {
    settings: MaskSettings,
}

impl MaskStage {
    pub fn new(settings: MaskSettings) -> Self {
        Self { settings }
    }

    fn settings<'a>(&'a self, ctx: &'a RunContext) -> &'a MaskSettings {
        ctx.overrides.as_deref().map_or(&self.settings, |s| &s.mask)
    }
}

fn outside_thresholds(settings: &MaskSettings, value: f64) -> bool {
    settings.lower_thresh.is_some_and(|lo| value < lo)
        || settings.upper_thresh.is_some_and(|hi| value > hi)
}

impl Stage for MaskStage {
    fn id(&self) -> StageId {
        StageId::Mask
    }

    fn process(&self, mut work: WorkItem, ctx: &RunContext) -> Result<WorkItem, StageError> {
        let settings = self.settings(ctx);
        let image = work.image_mut()?;
        let (rows, cols) = image.dim();
        let run_mask = ctx.mask.as_deref();
        if let Some(mask) = run_mask {
            if mask.dim() != (rows, cols) {
                return Err(StageError::Precondition(format!(
                    "mask is {:?} but the image is {:?}",
                    mask.dim(),
                    (rows, cols)
                )));
            }
        }

        let edge = settings.edge;
        for ((r, c), pixel) in image.indexed_iter_mut() {
            let on_edge = r < edge || c < edge || r + edge >= rows || c + edge >= cols;
            let masked = on_edge
                || run_mask.is_some_and(|m| m[[r, c]])
                || outside_thresholds(settings, *pixel);
            if masked {
                *pixel = f64::NAN;
            }
        }
        Ok(work)
    }
}
