//! Stage system for the diffraction-to-PDF pipeline.

pub mod calibrate;
pub mod dark;
pub mod integrate;
pub mod mask;
pub mod pdf;
pub mod pipeline;
pub mod structure;
pub mod traits;

pub use calibrate::CalibrationStage;
pub use dark::DarkSubtractionStage;
pub use integrate::{HistogramIntegrator, IntegrationSettings, IntegrationStage, Integrator};
pub use mask::{MaskSettings, MaskStage};
pub use pdf::{GridSettings, PdfStage, PdfTransformer, SineTransform};
pub use pipeline::{Pipeline, PipelineSettings, TransformResult};
pub use structure::{StructureFunctionStage, StructureSettings};
pub use traits::{Frame, Stage, StageId, WorkItem};
