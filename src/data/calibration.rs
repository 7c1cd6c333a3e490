//! Detector geometry (pyFAI "poni" convention, SI units).

use crate::error::{ConfigError, StageError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Calibration as carried in documents. Every field is optional so partial
/// calibrations from start and descriptor documents can be merged; the
/// calibration stage checks completeness.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Sample-to-detector distance (m).
    #[serde(default, alias = "dist", alias = "Distance", skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    /// Beam center along the slow axis (m).
    #[serde(default, alias = "Poni1", skip_serializing_if = "Option::is_none")]
    pub poni1: Option<f64>,
    /// Beam center along the fast axis (m).
    #[serde(default, alias = "Poni2", skip_serializing_if = "Option::is_none")]
    pub poni2: Option<f64>,
    #[serde(default, alias = "Rot1", skip_serializing_if = "Option::is_none")]
    pub rot1: Option<f64>,
    #[serde(default, alias = "Rot2", skip_serializing_if = "Option::is_none")]
    pub rot2: Option<f64>,
    #[serde(default, alias = "Rot3", skip_serializing_if = "Option::is_none")]
    pub rot3: Option<f64>,
    /// Pixel size along the slow axis (m).
    #[serde(default, alias = "PixelSize1", skip_serializing_if = "Option::is_none")]
    pub pixel1: Option<f64>,
    /// Pixel size along the fast axis (m).
    #[serde(default, alias = "PixelSize2", skip_serializing_if = "Option::is_none")]
    pub pixel2: Option<f64>,
    /// X-ray wavelength (m).
    #[serde(default, alias = "Wavelength", skip_serializing_if = "Option::is_none")]
    pub wavelength: Option<f64>,
}

/// Complete, validated geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    pub distance: f64,
    pub poni1: f64,
    pub poni2: f64,
    pub rot1: f64,
    pub rot2: f64,
    pub rot3: f64,
    pub pixel1: f64,
    pub pixel2: f64,
    pub wavelength: f64,
}

impl Geometry {
    /// Wavelength in Ångström.
    pub fn wavelength_angstrom(&self) -> f64 {
        self.wavelength * 1e10
    }

    /// Scattering angle 2θ in degrees for momentum transfer `q` (Å⁻¹).
    ///
    /// NaN when `q` is beyond the reach of the wavelength.
    pub fn two_theta_deg(&self, q: f64) -> f64 {
        let sin_theta = q * self.wavelength_angstrom() / (4.0 * std::f64::consts::PI);
        2.0 * sin_theta.asin().to_degrees()
    }

    /// Momentum transfer (Å⁻¹) at the center of pixel `(row, col)`.
    pub fn q_at(&self, row: usize, col: usize) -> f64 {
        let d1 = (row as f64 + 0.5) * self.pixel1 - self.poni1;
        let d2 = (col as f64 + 0.5) * self.pixel2 - self.poni2;
        // Rotations are applied as a small tilt of the detector plane.
        let (x, y, z) = tilt(d1, d2, self.distance, self.rot1, self.rot2, self.rot3);
        let two_theta = (x * x + y * y).sqrt().atan2(z);
        4.0 * std::f64::consts::PI * (two_theta / 2.0).sin() / self.wavelength_angstrom()
    }
}

fn tilt(d1: f64, d2: f64, l: f64, rot1: f64, rot2: f64, rot3: f64) -> (f64, f64, f64) {
    if rot1 == 0.0 && rot2 == 0.0 && rot3 == 0.0 {
        return (d1, d2, l);
    }
    let (s1, c1) = rot1.sin_cos();
    let (s2, c2) = rot2.sin_cos();
    let (s3, c3) = rot3.sin_cos();
    let x = c2 * c3 * d1 + (c3 * s1 * s2 - c1 * s3) * d2 - l * (c1 * c3 * s2 + s1 * s3);
    let y = c2 * s3 * d1 + (c1 * c3 + s1 * s2 * s3) * d2 - l * (c1 * s2 * s3 - c3 * s1);
    let z = d1 * s2 - c2 * s1 * d2 + c1 * c2 * l;
    (x, y, z)
}

impl Calibration {
    /// Overlay the fields present in `other` onto `self`.
    pub fn merge(&mut self, other: &Calibration) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(distance, poni1, poni2, rot1, rot2, rot3, pixel1, pixel2, wavelength);
    }

    /// Check completeness and physical plausibility.
    pub fn validate(&self) -> Result<Geometry, StageError> {
        let distance = require(self.distance, "distance")?;
        let poni1 = require(self.poni1, "poni1")?;
        let poni2 = require(self.poni2, "poni2")?;
        let pixel1 = require(self.pixel1, "pixel1")?;
        let pixel2 = require(self.pixel2, "pixel2")?;
        let wavelength = require(self.wavelength, "wavelength")?;
        let rot1 = self.rot1.unwrap_or(0.0);
        let rot2 = self.rot2.unwrap_or(0.0);
        let rot3 = self.rot3.unwrap_or(0.0);

        check_range("distance", distance, 1e-3, 10.0)?;
        check_range("wavelength", wavelength, 1e-12, 1e-8)?;
        check_range("pixel1", pixel1, 1e-7, 1e-2)?;
        check_range("pixel2", pixel2, 1e-7, 1e-2)?;
        check_range("poni1", poni1, -1.0, 1.0)?;
        check_range("poni2", poni2, -1.0, 1.0)?;
        for (name, rot) in [("rot1", rot1), ("rot2", rot2), ("rot3", rot3)] {
            check_range(name, rot, -std::f64::consts::PI, std::f64::consts::PI)?;
        }

        Ok(Geometry {
            distance,
            poni1,
            poni2,
            rot1,
            rot2,
            rot3,
            pixel1,
            pixel2,
            wavelength,
        })
    }

    /// Read a pyFAI `.poni` file.
    pub fn from_poni_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse_poni(&text).map_err(|reason| ConfigError::Parse {
            path: path.display().to_string(),
            reason,
        })
    }

    /// Parse the `Key: value` text format of pyFAI `.poni` files.
    pub fn parse_poni(text: &str) -> Result<Self, String> {
        let mut calibration = Calibration::default();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                return Err(format!("line {}: expected 'key: value'", lineno + 1));
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            let number = || {
                value
                    .parse::<f64>()
                    .map_err(|_| format!("line {}: '{value}' is not a number", lineno + 1))
            };
            match key.as_str() {
                "distance" | "dist" => calibration.distance = Some(number()?),
                "poni1" => calibration.poni1 = Some(number()?),
                "poni2" => calibration.poni2 = Some(number()?),
                "rot1" => calibration.rot1 = Some(number()?),
                "rot2" => calibration.rot2 = Some(number()?),
                "rot3" => calibration.rot3 = Some(number()?),
                "pixelsize1" => calibration.pixel1 = Some(number()?),
                "pixelsize2" => calibration.pixel2 = Some(number()?),
                "wavelength" => calibration.wavelength = Some(number()?),
                "detector_config" => {
                    let config: serde_json::Value = serde_json::from_str(value)
                        .map_err(|e| format!("line {}: bad detector config: {e}", lineno + 1))?;
                    calibration.pixel1 = config["pixel1"].as_f64().or(calibration.pixel1);
                    calibration.pixel2 = config["pixel2"].as_f64().or(calibration.pixel2);
                }
                // poni_version, detector and anything else are informational
                _ => {}
            }
        }
        Ok(calibration)
    }
}

fn require(value: Option<f64>, name: &str) -> Result<f64, StageError> {
    value.ok_or_else(|| StageError::Calibration(format!("missing geometry parameter '{name}'")))
}

fn check_range(name: &str, value: f64, min: f64, max: f64) -> Result<(), StageError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(StageError::Calibration(format!(
            "{name} = {value} is outside the plausible range [{min}, {max}]"
        )))
    }
}
