//! Dark-frame subtraction.

use super::traits::{Stage, StageId, WorkItem};
use crate::error::StageError;
use crate::run::RunContext;

/// Subtracts `scale × dark` from the event image.
#[derive(Debug, Default)]
pub struct DarkSubtractionStage;

/// Scale applied to the dark frame.
///
/// The run's background scale, multiplied by the exposure ratio when both
/// the event and the dark frame report a positive exposure.
pub fn dark_scale(background_scale: f64, event_exposure: Option<f64>, dark_exposure: Option<f64>) -> f64 {
    match (event_exposure, dark_exposure) {
        (Some(event), Some(dark)) if event > 0.0 && dark > 0.0 => background_scale * event / dark,
        _ => background_scale,
    }
}

impl Stage for DarkSubtractionStage {
    fn id(&self) -> StageId {
        StageId::DarkSubtraction
    }

    fn is_enabled(&self, ctx: &RunContext) -> bool {
        ctx.dark.is_some()
    }

    fn process(&self, mut work: WorkItem, ctx: &RunContext) -> Result<WorkItem, StageError> {
        let Some(dark) = &ctx.dark else {
            return Ok(work);
        };
        let scale = dark_scale(ctx.background_scale, work.exposure_time, dark.exposure_time);
        let image = work.image_mut()?;
        if image.dim() != dark.image.dim() {
            return Err(StageError::Precondition(format!(
                "dark frame is {:?} but the image is {:?}",
                dark.image.dim(),
                image.dim()
            )));
        }

        image.zip_mut_with(dark.image.as_ref(), |pixel, &d| *pixel -= scale * d);
        Ok(work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{DarkReference, RunDefaults};
    use ndarray::Array2;
    use std::sync::Arc;
    use uuid::Uuid;

    fn context(dark: Array2<f64>, exposure: Option<f64>, scale: f64) -> RunContext {
        let mut ctx = RunContext::new(Uuid::new_v4(), 0.0, &RunDefaults::default());
        ctx.dark = Some(DarkReference {
            image: Arc::new(dark),
            exposure_time: exposure,
        });
        ctx.background_scale = scale;
        ctx
    }

    #[test]
    fn test_dark_scale() {
        assert_eq!(dark_scale(0.5, Some(2.0), Some(1.0)), 1.0);
        assert_eq!(dark_scale(0.5, None, Some(1.0)), 0.5);
        assert_eq!(dark_scale(0.5, Some(2.0), Some(0.0)), 0.5);
    }

    #[test]
    fn test_subtracts_scaled_dark() {
        let ctx = context(Array2::from_elem((2, 2), 2.0), Some(1.0), 0.5);
        let work = WorkItem::new(ctx.run_id, 0, Array2::from_elem((2, 2), 10.0))
            .with_exposure_time(Some(2.0));

        let out = DarkSubtractionStage.process(work, &ctx).unwrap();
        assert!(out.image().unwrap().iter().all(|&v| v == 8.0));
    }

    #[test]
    fn test_shape_mismatch() {
        let ctx = context(Array2::zeros((3, 3)), None, 1.0);
        let work = WorkItem::new(ctx.run_id, 0, Array2::zeros((2, 2)));

        let err = DarkSubtractionStage.process(work, &ctx).unwrap_err();
        assert_eq!(err.cause(), "TransformPreconditionError");
    }

    #[test]
    fn test_disabled_without_dark() {
        let ctx = RunContext::new(Uuid::new_v4(), 0.0, &RunDefaults::default());
        assert!(!DarkSubtractionStage.is_enabled(&ctx));
    }
}
