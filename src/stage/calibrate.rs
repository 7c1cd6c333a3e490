//! Calibration check.

use super::traits::{Stage, StageId, WorkItem};
use crate::error::StageError;
use crate::run::RunContext;

/// Validates the run's geometry and attaches it to the work item.
#[derive(Debug, Default)]
pub struct CalibrationStage;

impl Stage for CalibrationStage {
    fn id(&self) -> StageId {
        StageId::Calibration
    }

    fn process(&self, mut work: WorkItem, ctx: &RunContext) -> Result<WorkItem, StageError> {
        let calibration = ctx
            .calibration
            .as_ref()
            .ok_or_else(|| StageError::Calibration("run carries no calibration".to_string()))?;
        work.geometry = Some(calibration.validate()?);
        Ok(work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Calibration;
    use crate::run::RunDefaults;
    use ndarray::Array2;
    use uuid::Uuid;

    #[test]
    fn test_missing_calibration() {
        let ctx = RunContext::new(Uuid::new_v4(), 0.0, &RunDefaults::default());
        let err = CalibrationStage
            .process(WorkItem::new(ctx.run_id, 0, Array2::zeros((2, 2))), &ctx)
            .unwrap_err();
        assert_eq!(err.cause(), "CalibrationError");
    }

    #[test]
    fn test_attaches_geometry() {
        let mut ctx = RunContext::new(Uuid::new_v4(), 0.0, &RunDefaults::default());
        ctx.calibration = Some(Calibration {
            distance: Some(0.2),
            poni1: Some(0.02),
            poni2: Some(0.02),
            pixel1: Some(2e-4),
            pixel2: Some(2e-4),
            wavelength: Some(1.8e-11),
            ..Default::default()
        });

        let out = CalibrationStage
            .process(WorkItem::new(ctx.run_id, 0, Array2::zeros((2, 2))), &ctx)
            .unwrap();
        assert_eq!(out.geometry.unwrap().distance, 0.2);
    }
}
