//! Data structures carried on the bus and through the pipeline.

pub mod calibration;
pub mod curve;
pub mod document;
pub mod frame;

pub use calibration::{Calibration, Geometry};
pub use curve::{Curve, CurveError};
pub use document::{
    now_secs, AnalysisPayload, DataKey, DescriptorPayload, Document, DocumentBody, DocumentKind,
    ErrorPayload, EventPayload, ExitStatus, RunSettings, RunStartPayload, RunStopPayload,
};
pub use frame::{DarkFrame, ImageFrame, MaskFrame};
