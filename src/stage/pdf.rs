//! F(Q) to G(r) transform.

use super::traits::{Frame, Stage, StageId, WorkItem};
use crate::data::Curve;
use crate::error::StageError;
use crate::run::RunContext;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;

/// Output r grid (Å).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSettings {
    pub rmin: f64,
    pub rmax: f64,
    pub rstep: f64,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            rmin: 0.0,
            rmax: 30.0,
            rstep: 0.01,
        }
    }
}

impl GridSettings {
    /// Number of grid points: `round((rmax - rmin) / rstep) + 1`.
    pub fn point_count(&self) -> usize {
        ((self.rmax - self.rmin) / self.rstep).round() as usize + 1
    }

    pub fn points(&self) -> Vec<f64> {
        (0..self.point_count())
            .map(|i| self.rmin + i as f64 * self.rstep)
            .collect()
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.rstep.is_finite() && self.rstep > 0.0) {
            return Err(format!("rstep must be positive, got {}", self.rstep));
        }
        if !(self.rmin.is_finite() && self.rmax.is_finite() && self.rmax > self.rmin) {
            return Err(format!(
                "r grid [{}, {}] is empty",
                self.rmin, self.rmax
            ));
        }
        Ok(())
    }
}

/// Turns a corrected F(Q) into G(r) evaluated on `r`.
///
/// Callers guarantee the input is finite, monotonic and has at least two
/// points; the output must have exactly `r.len()` values.
pub trait PdfTransformer: Send + Sync {
    fn transform(&self, fq: &Curve, r: &[f64]) -> Result<Curve, StageError>;
}

/// Direct sine transform `G(r) = 2/π ∫ F(Q) sin(Qr) dQ` by the trapezoid rule.
#[derive(Debug, Default, Clone, Copy)]
pub struct SineTransform;

impl PdfTransformer for SineTransform {
    fn transform(&self, fq: &Curve, r: &[f64]) -> Result<Curve, StageError> {
        let g: Vec<f64> = r
            .par_iter()
            .map(|&r| {
                let integral: f64 = fq
                    .x
                    .windows(2)
                    .zip(fq.y.windows(2))
                    .map(|(q, f)| {
                        0.5 * (q[1] - q[0]) * (f[0] * (q[0] * r).sin() + f[1] * (q[1] * r).sin())
                    })
                    .sum();
                2.0 / PI * integral
            })
            .collect();
        Curve::new(r.to_vec(), g).map_err(|e| StageError::Precondition(e.to_string()))
    }
}

pub struct PdfStage {
    grid: Vec<f64>,
    transformer: Arc<dyn PdfTransformer>,
}

impl PdfStage {
    pub fn new(grid: &GridSettings, transformer: Arc<dyn PdfTransformer>) -> Self {
        Self {
            grid: grid.points(),
            transformer,
        }
    }
}

impl Stage for PdfStage {
    fn id(&self) -> StageId {
        StageId::PdfTransform
    }

    fn process(&self, mut work: WorkItem, ctx: &RunContext) -> Result<WorkItem, StageError> {
        let run_grid = ctx.overrides.as_deref().map(|s| s.grid.points());
        let grid = run_grid.as_deref().unwrap_or(self.grid.as_slice());
        let curve = match &work.frame {
            Frame::StructureFunction {
                curve,
                corrected: true,
            } => curve,
            Frame::StructureFunction { .. } => {
                return Err(StageError::Precondition(
                    "structure function has not been background-corrected".to_string(),
                ))
            }
            other => {
                return Err(StageError::Precondition(format!(
                    "expected a structure function, found {}",
                    other.kind()
                )))
            }
        };
        if curve.len() < 2 {
            return Err(StageError::Precondition(format!(
                "structure function has {} points, need at least 2",
                curve.len()
            )));
        }
        if !curve.is_finite() {
            return Err(StageError::Precondition(
                "structure function contains non-finite values".to_string(),
            ));
        }
        if !curve.is_monotonic() {
            return Err(StageError::Precondition(
                "structure function Q axis is not monotonic".to_string(),
            ));
        }

        let gr = self.transformer.transform(curve, grid)?;
        if gr.len() != grid.len() {
            return Err(StageError::Precondition(format!(
                "transformer returned {} points for a grid of {}",
                gr.len(),
                grid.len()
            )));
        }
        work.frame = Frame::Pdf(gr);
        Ok(work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunDefaults;
    use ndarray::Array2;
    use uuid::Uuid;

    fn work_with(curve: Curve, corrected: bool) -> (WorkItem, RunContext) {
        let ctx = RunContext::new(Uuid::new_v4(), 0.0, &RunDefaults::default());
        let mut work = WorkItem::new(ctx.run_id, 0, Array2::zeros((1, 1)));
        work.frame = Frame::StructureFunction { curve, corrected };
        (work, ctx)
    }

    fn fq() -> Curve {
        let q: Vec<f64> = (0..500).map(|i| 0.5 + i as f64 * 0.05).collect();
        let f = q.iter().map(|&q| (2.5 * q).sin() * (-0.01 * q * q).exp()).collect();
        Curve::new(q, f).unwrap()
    }

    #[test]
    fn test_grid_length() {
        assert_eq!(GridSettings::default().point_count(), 3001);
        let grid = GridSettings {
            rmin: 1.0,
            rmax: 2.0,
            rstep: 0.3,
        };
        assert_eq!(grid.point_count(), 4);
        assert!(GridSettings { rstep: 0.0, ..Default::default() }.validate().is_err());
    }

    #[test]
    fn test_sine_transform_peak() {
        // sin(2.5 Q) in F(Q) shows up as a peak near r = 2.5 Å.
        let grid = GridSettings {
            rmin: 0.0,
            rmax: 5.0,
            rstep: 0.01,
        };
        let gr = SineTransform.transform(&fq(), &grid.points()).unwrap();
        let (peak, _) = gr
            .y
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });

        assert_eq!(gr.len(), 501);
        assert!((gr.x[peak] - 2.5).abs() < 0.1);
    }

    #[test]
    fn test_stage_output_length() {
        let grid = GridSettings {
            rmin: 0.0,
            rmax: 10.0,
            rstep: 0.1,
        };
        let stage = PdfStage::new(&grid, Arc::new(SineTransform));
        let (work, ctx) = work_with(fq(), true);

        let out = stage.process(work, &ctx).unwrap();
        match out.frame {
            Frame::Pdf(gr) => assert_eq!(gr.len(), grid.point_count()),
            other => panic!("unexpected frame {}", other.kind()),
        }
    }

    #[test]
    fn test_run_grid_override() {
        let stage = PdfStage::new(&GridSettings::default(), Arc::new(SineTransform));
        let (work, mut ctx) = work_with(fq(), true);
        let overrides = crate::stage::PipelineSettings {
            grid: GridSettings {
                rmin: 0.0,
                rmax: 2.0,
                rstep: 0.5,
            },
            ..Default::default()
        };
        ctx.overrides = Some(Arc::new(overrides));

        match stage.process(work, &ctx).unwrap().frame {
            Frame::Pdf(gr) => assert_eq!(gr.x, vec![0.0, 0.5, 1.0, 1.5, 2.0]),
            other => panic!("unexpected frame {}", other.kind()),
        }
    }

    #[test]
    fn test_preconditions() {
        let stage = PdfStage::new(&GridSettings::default(), Arc::new(SineTransform));

        let (work, ctx) = work_with(fq(), false);
        assert!(stage.process(work, &ctx).is_err());

        let single = Curve::new(vec![1.0], vec![0.0]).unwrap();
        let (work, ctx) = work_with(single, true);
        assert!(stage.process(work, &ctx).is_err());

        let nan = Curve::new(vec![1.0, 2.0], vec![0.0, f64::NAN]).unwrap();
        let (work, ctx) = work_with(nan, true);
        let err = stage.process(work, &ctx).unwrap_err();
        assert_eq!(err.cause(), "TransformPreconditionError");
    }
}
