//! Configuration loading.
//!
//! Values are layered with `figment`: built-in defaults, then an optional TOML
//! file, then environment variables prefixed `PDFSTREAM_` with `__` separating
//! sections (`PDFSTREAM_SERVER__MAX_IN_FLIGHT=32`).
//!
//! ```toml
//! [relay]
//! backend = "127.0.0.1:5567"
//! frontend = "127.0.0.1:5568"
//!
//! [server]
//! drain_timeout = "5s"
//!
//! [pipeline]
//! calibration_file = "Ni.poni"
//! background_scale = 0.9
//!
//! [pipeline.grid]
//! rmax = 30.0
//! rstep = 0.01
//! ```

use crate::data::{Calibration, MaskFrame};
use crate::error::ConfigError;
use crate::run::{RunDefaults, DEFAULT_CLOSED_RUN_MEMORY};
use crate::stage::{
    GridSettings, IntegrationSettings, MaskSettings, PipelineSettings, StructureSettings,
};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "PDFSTREAM_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay: RelayConfig,
    pub server: ServerConfig,
    pub pipeline: PipelineConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Producer-facing listener.
    pub backend: SocketAddr,
    /// Consumer-facing listener.
    pub frontend: SocketAddr,
    /// Frames buffered per consumer before the oldest are dropped.
    pub consumer_buffer: usize,
    pub max_frame_length: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backend: SocketAddr::from(([127, 0, 0, 1], 5567)),
            frontend: SocketAddr::from(([127, 0, 0, 1], 5568)),
            consumer_buffer: 1024,
            max_frame_length: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Transform threads; the number of CPUs when unset.
    pub worker_count: Option<usize>,
    /// Events transformed or queued for publishing at once.
    pub max_in_flight: usize,
    /// Bounded wait for in-flight transforms on stop.
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
    /// Stopped run ids remembered to tell closed runs from unknown ones.
    pub closed_run_memory: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            worker_count: None,
            max_in_flight: 64,
            drain_timeout: Duration::from_secs(5),
            closed_run_memory: DEFAULT_CLOSED_RUN_MEMORY,
        }
    }
}

impl ServerConfig {
    pub fn workers(&self) -> usize {
        self.worker_count.unwrap_or_else(num_cpus::get).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// pyFAI `.poni` file used when a run brings no calibration.
    pub calibration_file: Option<PathBuf>,
    /// JSON mask frame used when a run brings no mask.
    pub mask_file: Option<PathBuf>,
    pub background_scale: f64,
    pub mask: MaskSettings,
    pub integration: IntegrationSettings,
    pub structure: StructureSettings,
    pub grid: GridSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            calibration_file: None,
            mask_file: None,
            background_scale: 1.0,
            mask: MaskSettings::default(),
            integration: IntegrationSettings::default(),
            structure: StructureSettings::default(),
            grid: GridSettings::default(),
        }
    }
}

impl PipelineConfig {
    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            mask: self.mask.clone(),
            integration: self.integration.clone(),
            structure: self.structure.clone(),
            grid: self.grid.clone(),
        }
    }

    /// Load the calibration and mask files into per-run defaults.
    pub fn run_defaults(&self) -> Result<RunDefaults, ConfigError> {
        let calibration = self
            .calibration_file
            .as_deref()
            .map(Calibration::from_poni_file)
            .transpose()?;
        let mask = self
            .mask_file
            .as_deref()
            .map(load_mask)
            .transpose()?
            .map(Arc::new);
        Ok(RunDefaults {
            calibration,
            mask,
            background_scale: self.background_scale,
            pipeline: self.settings(),
        })
    }
}

fn load_mask(path: &Path) -> Result<ndarray::Array2<bool>, ConfigError> {
    let parse_error = |reason: String| ConfigError::Parse {
        path: path.display().to_string(),
        reason,
    };
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let frame: MaskFrame = serde_json::from_str(&text).map_err(|e| parse_error(e.to_string()))?;
    frame.to_array().map_err(parse_error)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config: Config = Self::figment(path)?.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The layered provider stack, for callers that merge their own layers.
    pub fn figment(path: Option<&Path>) -> Result<Figment, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
                });
            }
            figment = figment.merge(Toml::file(path));
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Validation(msg));

        if self.relay.backend == self.relay.frontend && self.relay.backend.port() != 0 {
            return invalid(format!(
                "relay backend and frontend share the address {}",
                self.relay.backend
            ));
        }
        if self.relay.consumer_buffer == 0 {
            return invalid("relay.consumer_buffer must be at least 1".into());
        }
        if self.relay.max_frame_length == 0 {
            return invalid("relay.max_frame_length must be at least 1".into());
        }
        if self.server.worker_count == Some(0) {
            return invalid("server.worker_count must be at least 1".into());
        }
        if self.server.max_in_flight == 0 {
            return invalid("server.max_in_flight must be at least 1".into());
        }

        let pipeline = &self.pipeline;
        if !pipeline.background_scale.is_finite() {
            return invalid("pipeline.background_scale must be finite".into());
        }
        if pipeline.integration.npt == 0 {
            return invalid("pipeline.integration.npt must be at least 1".into());
        }
        if let (Some(lo), Some(hi)) = (pipeline.mask.lower_thresh, pipeline.mask.upper_thresh) {
            if lo > hi {
                return invalid(format!("pipeline.mask thresholds are inverted: {lo} > {hi}"));
            }
        }
        if pipeline.mask.alpha.is_some_and(|a| !(a.is_finite() && a > 0.0)) {
            return invalid("pipeline.mask.alpha must be positive".into());
        }
        let structure = &pipeline.structure;
        if !(structure.qmax > structure.qmin) {
            return invalid(format!(
                "pipeline.structure Q range [{}, {}] is empty",
                structure.qmin, structure.qmax
            ));
        }
        if !(structure.rpoly >= 0.0 && structure.qmaxinst > 0.0) {
            return invalid("pipeline.structure.rpoly and qmaxinst must be positive".into());
        }
        pipeline
            .grid
            .validate()
            .map_err(|e| ConfigError::Validation(format!("pipeline.grid: {e}")))?;

        if tracing_subscriber::EnvFilter::try_new(&self.log.level).is_err() {
            return invalid(format!("log.level '{}' is not a valid filter", self.log.level));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline.integration.npt, 1480);
        assert_eq!(config.pipeline.structure.rpoly, 0.9);
        assert_eq!(config.pipeline.grid.rstep, 0.01);
        assert_eq!(config.server.drain_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_toml_layer() {
        let file = write_file(
            r#"
            [server]
            max_in_flight = 8
            drain_timeout = "250ms"

            [pipeline]
            background_scale = 0.5

            [pipeline.grid]
            rmax = 20.0
            rstep = 0.05

            [log]
            level = "debug"
            "#,
        );

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.server.max_in_flight, 8);
        assert_eq!(config.server.drain_timeout, Duration::from_millis(250));
        assert_eq!(config.pipeline.background_scale, 0.5);
        assert_eq!(config.pipeline.grid.point_count(), 401);
        assert_eq!(config.pipeline.structure.qmax, 24.0);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load(Some(Path::new("/nonexistent/pdfstream.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_validation_rejects_bad_grid() {
        let file = write_file("[pipeline.grid]\nrstep = 0.0\n");
        let err = Config::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_run_defaults_from_files() {
        let poni = write_file(
            "# Calibration\nPixelSize1: 0.0002\nPixelSize2: 0.0002\nDistance: 0.2\n\
             Poni1: 0.02\nPoni2: 0.02\nRot1: 0\nRot2: 0\nRot3: 0\nWavelength: 1.8e-11\n",
        );
        let mask = write_file(r#"{"shape": [2, 2], "data": [1, 0, 0, 1]}"#);
        let pipeline = PipelineConfig {
            calibration_file: Some(poni.path().to_path_buf()),
            mask_file: Some(mask.path().to_path_buf()),
            background_scale: 0.7,
            ..Default::default()
        };

        let defaults = pipeline.run_defaults().unwrap();
        assert!(defaults.calibration.unwrap().validate().is_ok());
        assert_eq!(defaults.mask.unwrap().iter().filter(|&&m| m).count(), 2);
        assert_eq!(defaults.background_scale, 0.7);
    }

    #[test]
    fn test_bad_mask_file() {
        let mask = write_file(r#"{"shape": [3, 3], "data": [1]}"#);
        let pipeline = PipelineConfig {
            mask_file: Some(mask.path().to_path_buf()),
            ..Default::default()
        };
        assert!(matches!(
            pipeline.run_defaults(),
            Err(ConfigError::Parse { .. })
        ));
    }
}
