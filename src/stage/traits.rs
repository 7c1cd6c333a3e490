//! Stage trait definitions.

use crate::data::{Curve, Geometry};
use crate::error::StageError;
use crate::run::RunContext;
use ndarray::Array2;
use std::fmt;
use uuid::Uuid;

/// Identifier for a stage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageId {
    /// Subtract the scaled dark frame.
    DarkSubtraction,
    /// Invalidate masked pixels.
    Mask,
    /// Check the detector geometry.
    Calibration,
    /// Reduce the image to I(Q).
    Integration,
    /// I(Q) to the corrected F(Q).
    StructureFunction,
    /// F(Q) to G(r).
    PdfTransform,
}

impl StageId {
    /// Get the string name of this stage.
    pub fn name(&self) -> &'static str {
        match self {
            StageId::DarkSubtraction => "dark_subtraction",
            StageId::Mask => "mask",
            StageId::Calibration => "calibration",
            StageId::Integration => "integration",
            StageId::StructureFunction => "structure_function",
            StageId::PdfTransform => "pdf_transform",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The data an event is carried as between stages.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Detector image; NaN marks invalid pixels.
    Image(Array2<f64>),
    /// Integrated I(Q).
    Pattern(Curve),
    /// F(Q), flagged once background-corrected.
    StructureFunction { curve: Curve, corrected: bool },
    /// G(r).
    Pdf(Curve),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Image(_) => "image",
            Frame::Pattern(_) => "I(Q) pattern",
            Frame::StructureFunction { .. } => "structure function",
            Frame::Pdf(_) => "PDF",
        }
    }
}

/// One event moving through the pipeline.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub run_id: Uuid,
    pub sequence_number: u64,
    pub frame: Frame,
    /// Exposure of the event image, when the event reports it.
    pub exposure_time: Option<f64>,
    /// Set by the calibration stage.
    pub geometry: Option<Geometry>,
    /// I(Q) kept for the analysis document.
    pub pattern: Option<Curve>,
    /// Corrected F(Q) kept for the analysis document.
    pub structure: Option<Curve>,
    /// Stages applied so far, in order.
    pub applied: Vec<StageId>,
}

impl WorkItem {
    pub fn new(run_id: Uuid, sequence_number: u64, image: Array2<f64>) -> Self {
        Self {
            run_id,
            sequence_number,
            frame: Frame::Image(image),
            exposure_time: None,
            geometry: None,
            pattern: None,
            structure: None,
            applied: Vec::new(),
        }
    }

    pub fn with_exposure_time(mut self, exposure_time: Option<f64>) -> Self {
        self.exposure_time = exposure_time;
        self
    }

    pub fn image(&self) -> Result<&Array2<f64>, StageError> {
        match &self.frame {
            Frame::Image(image) => Ok(image),
            other => Err(unexpected("an image", other)),
        }
    }

    pub fn image_mut(&mut self) -> Result<&mut Array2<f64>, StageError> {
        match &mut self.frame {
            Frame::Image(image) => Ok(image),
            other => Err(unexpected("an image", other)),
        }
    }

    pub fn pattern_curve(&self) -> Result<&Curve, StageError> {
        match &self.frame {
            Frame::Pattern(curve) => Ok(curve),
            other => Err(unexpected("an I(Q) pattern", other)),
        }
    }
}

fn unexpected(expected: &str, found: &Frame) -> StageError {
    StageError::Precondition(format!("expected {expected}, found {}", found.kind()))
}

/// Trait for processing stages.
pub trait Stage: Send + Sync {
    /// Get the stage identifier.
    fn id(&self) -> StageId;

    /// Process one event with the run's configuration.
    fn process(&self, work: WorkItem, ctx: &RunContext) -> Result<WorkItem, StageError>;

    /// Whether the stage applies to this run at all. Disabled stages are
    /// skipped and not listed among the applied stages.
    fn is_enabled(&self, _ctx: &RunContext) -> bool {
        true
    }

    /// Get the stage name.
    fn name(&self) -> &'static str {
        self.id().name()
    }
}
