//! Per-run configuration accumulated from start and descriptor documents.

use crate::data::{Calibration, DataKey, RunSettings};
use crate::stage::PipelineSettings;
use ndarray::Array2;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

/// Field name used for the image when no descriptor declares one.
pub const DEFAULT_IMAGE_KEY: &str = "image";

/// Where a run is in its document sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Start received, waiting for a descriptor.
    Started,
    /// At least one descriptor received; events are accepted.
    Described,
}

/// Dark-frame reference held by a run.
#[derive(Debug, Clone)]
pub struct DarkReference {
    pub image: Arc<Array2<f64>>,
    pub exposure_time: Option<f64>,
}

/// Server-wide fallbacks applied to every new run.
#[derive(Debug, Clone)]
pub struct RunDefaults {
    pub calibration: Option<Calibration>,
    pub mask: Option<Arc<Array2<bool>>>,
    pub background_scale: f64,
    /// Server pipeline settings that a run's `user_config` is overlaid on.
    pub pipeline: PipelineSettings,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            calibration: None,
            mask: None,
            background_scale: 1.0,
            pipeline: PipelineSettings::default(),
        }
    }
}

/// Accumulated configuration of one live run.
///
/// Transforms read it through an `Arc` snapshot; the tracker mutates it
/// copy-on-write, so in-flight events keep the configuration they started with.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub phase: RunPhase,
    pub sample_name: Option<String>,
    pub composition: Option<String>,
    pub calibration: Option<Calibration>,
    pub dark: Option<DarkReference>,
    pub mask: Option<Arc<Array2<bool>>>,
    pub background_scale: f64,
    /// Event field holding the detector image.
    pub image_key: String,
    pub data_keys: BTreeMap<String, DataKey>,
    /// Descriptor uids and names whose events carry calibration values.
    pub calibration_streams: BTreeSet<String>,
    /// Pipeline settings from the run's `user_config`; server settings when `None`.
    pub overrides: Option<Arc<PipelineSettings>>,
    pub descriptors: u32,
    pub started_at: f64,
}

impl RunContext {
    pub fn new(run_id: Uuid, started_at: f64, defaults: &RunDefaults) -> Self {
        Self {
            run_id,
            phase: RunPhase::Started,
            sample_name: None,
            composition: None,
            calibration: defaults.calibration.clone(),
            dark: None,
            mask: defaults.mask.clone(),
            background_scale: defaults.background_scale,
            image_key: DEFAULT_IMAGE_KEY.to_string(),
            data_keys: BTreeMap::new(),
            calibration_streams: BTreeSet::new(),
            overrides: None,
            descriptors: 0,
            started_at,
        }
    }

    /// Overlay `user_config` on the server pipeline settings for this run.
    pub fn apply_user_config(&mut self, base: &PipelineSettings, user_config: &Value) -> Result<(), String> {
        self.overrides = Some(Arc::new(base.with_user_config(user_config)?));
        Ok(())
    }

    /// Whether events referencing `descriptor` belong to a calibration stream.
    pub fn is_calibration_stream(&self, descriptor: Option<&str>) -> bool {
        descriptor.is_some_and(|d| self.calibration_streams.contains(d))
    }

    /// Merge run settings. Calibration fields overlay, everything else replaces.
    pub fn apply_settings(&mut self, settings: &RunSettings) -> Result<(), String> {
        if let Some(calibration) = &settings.calibration {
            match &mut self.calibration {
                Some(current) => current.merge(calibration),
                None => self.calibration = Some(calibration.clone()),
            }
        }
        if let Some(dark) = &settings.dark_frame {
            self.dark = Some(DarkReference {
                image: Arc::new(dark.image.to_array()?),
                exposure_time: dark.exposure_time,
            });
        }
        if let Some(mask) = &settings.mask {
            self.mask = Some(Arc::new(mask.to_array()?));
        }
        if let Some(scale) = settings.background_scale {
            if !scale.is_finite() {
                return Err(format!("background scale {scale} is not finite"));
            }
            self.background_scale = scale;
        }
        if let Some(composition) = &settings.composition {
            self.composition = Some(composition.clone());
        }
        Ok(())
    }

    /// Serializable view for operational queries.
    pub fn config_view(&self) -> RunConfigView {
        RunConfigView {
            run_id: self.run_id,
            phase: self.phase,
            sample_name: self.sample_name.clone(),
            composition: self.composition.clone(),
            calibration: self.calibration.clone(),
            calibration_valid: self
                .calibration
                .as_ref()
                .is_some_and(|c| c.validate().is_ok()),
            dark_frame_shape: self.dark.as_ref().map(|d| d.image.dim()),
            dark_exposure_time: self.dark.as_ref().and_then(|d| d.exposure_time),
            mask_shape: self.mask.as_ref().map(|m| m.dim()),
            masked_pixels: self
                .mask
                .as_ref()
                .map(|m| m.iter().filter(|&&v| v).count())
                .unwrap_or(0),
            background_scale: self.background_scale,
            image_key: self.image_key.clone(),
            data_keys: self.data_keys.clone(),
            pipeline_overrides: self.overrides.as_deref().cloned(),
        }
    }
}

/// What `run_config` reports.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfigView {
    pub run_id: Uuid,
    pub phase: RunPhase,
    pub sample_name: Option<String>,
    pub composition: Option<String>,
    pub calibration: Option<Calibration>,
    pub calibration_valid: bool,
    pub dark_frame_shape: Option<(usize, usize)>,
    pub dark_exposure_time: Option<f64>,
    pub mask_shape: Option<(usize, usize)>,
    pub masked_pixels: usize,
    pub background_scale: f64,
    pub image_key: String,
    pub data_keys: BTreeMap<String, DataKey>,
    pub pipeline_overrides: Option<PipelineSettings>,
}

/// What `active_runs` reports per run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub phase: RunPhase,
    pub events_accepted: u64,
    pub descriptors: u32,
    pub started_at: f64,
}
