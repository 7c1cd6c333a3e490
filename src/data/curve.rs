//! One-dimensional curves produced by the pipeline: I(Q), F(Q) and G(r).

/// A sampled curve `y(x)`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Curve {
    /// Independent variable (Q in Å⁻¹ or r in Å).
    pub x: Vec<f64>,

    /// Dependent variable.
    pub y: Vec<f64>,
}

impl Curve {
    /// Create a new curve.
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Result<Self, CurveError> {
        if x.len() != y.len() {
            return Err(CurveError::LengthMismatch {
                x_len: x.len(),
                y_len: y.len(),
            });
        }
        Ok(Self { x, y })
    }

    /// Get the number of data points.
    #[inline]
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Check if curve has no data points.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Non-decreasing independent axis.
    pub fn is_monotonic(&self) -> bool {
        self.x.windows(2).all(|w| w[1] >= w[0])
    }

    /// Every value on both axes is finite.
    pub fn is_finite(&self) -> bool {
        self.x.iter().chain(self.y.iter()).all(|v| v.is_finite())
    }

    /// Keep only points where `keep(x, y)` holds.
    pub fn retain(&self, keep: impl Fn(f64, f64) -> bool) -> Curve {
        let (x, y) = self
            .x
            .iter()
            .zip(self.y.iter())
            .filter(|(&x, &y)| keep(x, y))
            .map(|(&x, &y)| (x, y))
            .unzip();
        Curve { x, y }
    }

    /// Position and value of the largest finite `y`; `None` if there is none.
    pub fn peak(&self) -> Option<(f64, f64)> {
        self.x
            .iter()
            .zip(self.y.iter())
            .filter(|(_, y)| y.is_finite())
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(&x, &y)| (x, y))
    }
}

/// Errors that can occur when creating curves.
#[derive(Debug, Clone, PartialEq)]
pub enum CurveError {
    /// Axis lengths don't match.
    LengthMismatch { x_len: usize, y_len: usize },
}

impl std::fmt::Display for CurveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CurveError::LengthMismatch { x_len, y_len } => {
                write!(f, "Axis length mismatch: x={}, y={}", x_len, y_len)
            }
        }
    }
}

impl std::error::Error for CurveError {}
