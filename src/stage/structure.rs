//! Reduced structure function F(Q) from I(Q).
//!
//! The pattern is cut to `[qmin, qmax]`, normalised by its mean intensity to
//! S(Q), converted to F(Q) = Q·(S(Q) − 1), and finally a smooth polynomial
//! background is fitted and removed. The polynomial degree follows
//! `rpoly·qmaxinst/π`, so only features slower than `r < rpoly` are absorbed.

use super::traits::{Frame, Stage, StageId, WorkItem};
use crate::data::Curve;
use crate::error::StageError;
use crate::run::RunContext;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Structure-function settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StructureSettings {
    pub qmin: f64,
    pub qmax: f64,
    /// Instrument Q limit used for the background polynomial degree.
    pub qmaxinst: f64,
    /// Shortest r (Å) the background correction may touch.
    pub rpoly: f64,
}

impl Default for StructureSettings {
    fn default() -> Self {
        Self {
            qmin: 0.5,
            qmax: 24.0,
            qmaxinst: 24.0,
            rpoly: 0.9,
        }
    }
}

impl StructureSettings {
    pub fn polynomial_degree(&self) -> usize {
        (self.rpoly * self.qmaxinst / PI).round().max(0.0) as usize
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.qmin.is_finite() && self.qmax.is_finite() && self.qmax > self.qmin) {
            return Err(format!("Q window [{}, {}] is empty", self.qmin, self.qmax));
        }
        if !(self.rpoly.is_finite() && self.rpoly >= 0.0 && self.qmaxinst.is_finite()) {
            return Err(format!(
                "background needs finite rpoly >= 0 and qmaxinst, got {} and {}",
                self.rpoly, self.qmaxinst
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct StructureFunctionStage {
    settings: StructureSettings,
}

impl StructureFunctionStage {
    pub fn new(settings: StructureSettings) -> Self {
        Self { settings }
    }

    /// Compute the corrected F(Q) with the stage's own settings.
    pub fn structure_function(&self, pattern: &Curve) -> Result<Curve, StageError> {
        structure_function(&self.settings, pattern)
    }

    fn settings<'a>(&'a self, ctx: &'a RunContext) -> &'a StructureSettings {
        ctx.overrides.as_deref().map_or(&self.settings, |s| &s.structure)
    }
}

fn structure_function(settings: &StructureSettings, pattern: &Curve) -> Result<Curve, StageError> {
    let StructureSettings { qmin, qmax, .. } = *settings;
    let window = pattern.retain(|q, i| i.is_finite() && q >= qmin && q <= qmax);
    if window.len() < 2 {
        return Err(StageError::Precondition(format!(
            "only {} valid points in Q range [{qmin}, {qmax}]",
            window.len()
        )));
    }

    let mean = window.y.iter().sum::<f64>() / window.len() as f64;
    if !(mean.is_finite() && mean > 0.0) {
        return Err(StageError::Precondition(format!(
            "cannot normalise by mean intensity {mean}"
        )));
    }

    let fq: Vec<f64> = window
        .x
        .iter()
        .zip(window.y.iter())
        .map(|(&q, &i)| q * (i / mean - 1.0))
        .collect();

    let degree = settings.polynomial_degree().min(window.len() - 1);
    let background = fit_polynomial(&window.x, &fq, degree)?;
    let corrected = fq
        .iter()
        .zip(background.iter())
        .map(|(f, b)| f - b)
        .collect();

    Curve::new(window.x, corrected).map_err(|e| StageError::Precondition(e.to_string()))
}

/// Least-squares polynomial fit, evaluated back on `x`.
///
/// `x` is mapped to [-1, 1] first to keep the Vandermonde matrix well conditioned.
fn fit_polynomial(x: &[f64], y: &[f64], degree: usize) -> Result<Vec<f64>, StageError> {
    let (lo, hi) = (x[0], x[x.len() - 1]);
    let half = ((hi - lo) / 2.0).max(f64::EPSILON);
    let mid = (hi + lo) / 2.0;
    let t: Vec<f64> = x.iter().map(|&v| (v - mid) / half).collect();

    let a = DMatrix::from_fn(t.len(), degree + 1, |row, col| t[row].powi(col as i32));
    let b = DVector::from_column_slice(y);
    let coefficients = a
        .clone()
        .svd(true, true)
        .solve(&b, 1e-12)
        .map_err(|e| StageError::Precondition(format!("background fit failed: {e}")))?;

    Ok((&a * coefficients).iter().copied().collect())
}

impl Stage for StructureFunctionStage {
    fn id(&self) -> StageId {
        StageId::StructureFunction
    }

    fn process(&self, mut work: WorkItem, ctx: &RunContext) -> Result<WorkItem, StageError> {
        let curve = structure_function(self.settings(ctx), work.pattern_curve()?)?;
        work.structure = Some(curve.clone());
        work.frame = Frame::StructureFunction {
            curve,
            corrected: true,
        };
        Ok(work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(n: usize) -> Curve {
        let q: Vec<f64> = (0..n).map(|i| 0.1 + i as f64 * 0.1).collect();
        let i = q
            .iter()
            .map(|&q: &f64| 10.0 + (2.0 * q).sin() + 0.01 * q * q)
            .collect();
        Curve::new(q, i).unwrap()
    }

    #[test]
    fn test_default_degree() {
        assert_eq!(StructureSettings::default().polynomial_degree(), 7);
    }

    #[test]
    fn test_window_and_length() {
        let stage = StructureFunctionStage::new(StructureSettings {
            qmin: 1.0,
            qmax: 10.0,
            ..Default::default()
        });

        let fq = stage.structure_function(&pattern(200)).unwrap();
        assert!(fq.x.first().unwrap() >= &1.0);
        assert!(fq.x.last().unwrap() <= &10.0);
        assert!(fq.is_finite());
        assert!(fq.is_monotonic());
    }

    #[test]
    fn test_background_removed() {
        // A pure polynomial F(Q) is absorbed entirely by the background fit.
        let q: Vec<f64> = (0..100).map(|i| 1.0 + i as f64 * 0.1).collect();
        let y: Vec<f64> = q.iter().map(|&q| 1.0 + 0.5 * q).collect();
        let fitted = fit_polynomial(&q, &y, 3).unwrap();

        for (a, b) in fitted.iter().zip(y.iter()) {
            assert!((a - b).abs() < 1e-8);
        }
    }

    #[test]
    fn test_too_few_points() {
        let stage = StructureFunctionStage::default();
        let curve = Curve::new(vec![1.0, 2.0], vec![f64::NAN, 1.0]).unwrap();

        let err = stage.structure_function(&curve).unwrap_err();
        assert_eq!(err.cause(), "TransformPreconditionError");
    }
}
