//! Azimuthal integration: masked 2-D image to a 1-D I(Q) pattern.

use super::traits::{Frame, Stage, StageId, WorkItem};
use crate::data::{Curve, Geometry};
use crate::error::StageError;
use crate::run::RunContext;
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Integration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationSettings {
    /// Number of Q bins.
    pub npt: usize,
}

impl Default for IntegrationSettings {
    fn default() -> Self {
        Self { npt: 1480 }
    }
}

/// Reduces a 2-D image to I(Q).
///
/// Implementations must return `npt` points on a non-decreasing Q axis in
/// Å⁻¹ whose length does not depend on how many pixels are masked. NaN pixels
/// are invalid and must be ignored.
pub trait Integrator: Send + Sync {
    fn integrate(&self, image: &Array2<f64>, geometry: &Geometry) -> Result<Curve, StageError>;
}

/// Running sums for one Q bin.
#[derive(Debug, Clone, Copy, Default)]
struct BinStats {
    count: u64,
    sum: f64,
    sum_sq: f64,
}

impl BinStats {
    fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
    }

    fn merge(&mut self, other: &BinStats) {
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.sum / self.count as f64
        }
    }

    fn std(&self) -> f64 {
        if self.count == 0 {
            return f64::NAN;
        }
        let mean = self.mean();
        (self.sum_sq / self.count as f64 - mean * mean).max(0.0).sqrt()
    }
}

/// Default integrator: averages pixels into equal-width Q bins, optionally
/// rejecting per-bin outliers beyond `alpha` standard deviations.
#[derive(Debug, Clone)]
pub struct HistogramIntegrator {
    npt: usize,
    alpha: Option<f64>,
}

impl HistogramIntegrator {
    pub fn new(npt: usize, alpha: Option<f64>) -> Self {
        Self { npt, alpha }
    }

    fn accumulate(
        &self,
        pixels: &[(usize, f64)],
        keep: impl Fn(usize, f64) -> bool + Sync,
    ) -> Vec<BinStats> {
        pixels
            .par_iter()
            .fold(
                || vec![BinStats::default(); self.npt],
                |mut bins, &(bin, value)| {
                    if keep(bin, value) {
                        bins[bin].push(value);
                    }
                    bins
                },
            )
            .reduce(
                || vec![BinStats::default(); self.npt],
                |mut a, b| {
                    a.iter_mut().zip(b.iter()).for_each(|(x, y)| x.merge(y));
                    a
                },
            )
    }
}

impl Integrator for HistogramIntegrator {
    fn integrate(&self, image: &Array2<f64>, geometry: &Geometry) -> Result<Curve, StageError> {
        if self.npt == 0 {
            return Err(StageError::Precondition("integration needs npt > 0".to_string()));
        }
        let (rows, cols) = image.dim();
        let q_map: Vec<f64> = (0..rows * cols)
            .into_par_iter()
            .map(|i| geometry.q_at(i / cols, i % cols))
            .collect();

        // The Q range is a property of the geometry, not of the mask.
        let (q_lo, q_hi) = q_map
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &q| (lo.min(q), hi.max(q)));
        if !(q_hi > q_lo) || !q_lo.is_finite() || !q_hi.is_finite() {
            return Err(StageError::Precondition(format!(
                "degenerate Q range [{q_lo}, {q_hi}] for a {rows}x{cols} image"
            )));
        }
        let width = (q_hi - q_lo) / self.npt as f64;

        let pixels: Vec<(usize, f64)> = q_map
            .iter()
            .zip(image.iter())
            .filter(|(_, value)| value.is_finite())
            .map(|(&q, &value)| {
                let bin = (((q - q_lo) / width) as usize).min(self.npt - 1);
                (bin, value)
            })
            .collect();

        let mut bins = self.accumulate(&pixels, |_, _| true);
        if let Some(alpha) = self.alpha {
            let bounds: Vec<(f64, f64)> = bins
                .iter()
                .map(|b| {
                    let (mean, std) = (b.mean(), b.std());
                    (mean - alpha * std, mean + alpha * std)
                })
                .collect();
            bins = self.accumulate(&pixels, |bin, value| {
                let (lo, hi) = bounds[bin];
                value >= lo && value <= hi
            });
        }

        let q = (0..self.npt)
            .map(|i| q_lo + (i as f64 + 0.5) * width)
            .collect();
        let intensity = bins.iter().map(BinStats::mean).collect();
        Curve::new(q, intensity).map_err(|e| StageError::Precondition(e.to_string()))
    }
}

/// Stage wrapper around an [`Integrator`].
pub struct IntegrationStage {
    integrator: Arc<dyn Integrator>,
}

impl IntegrationStage {
    pub fn new(integrator: Arc<dyn Integrator>) -> Self {
        Self { integrator }
    }
}

impl Stage for IntegrationStage {
    fn id(&self) -> StageId {
        StageId::Integration
    }

    fn process(&self, mut work: WorkItem, _ctx: &RunContext) -> Result<WorkItem, StageError> {
        let geometry = work.geometry.ok_or_else(|| {
            StageError::Calibration("integration requires a validated geometry".to_string())
        })?;
        let pattern = self.integrator.integrate(work.image()?, &geometry)?;
        work.pattern = Some(pattern.clone());
        work.frame = Frame::Pattern(pattern);
        Ok(work)
    }
}
