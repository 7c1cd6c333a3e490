//! Detector image and mask frames as they appear in document payloads.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Row-major 2-D detector image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageFrame {
    /// `[rows, cols]`.
    pub shape: [usize; 2],
    pub data: Vec<f64>,
}

impl ImageFrame {
    pub fn new(shape: [usize; 2], data: Vec<f64>) -> Self {
        Self { shape, data }
    }

    /// Image filled with a single value.
    pub fn uniform(rows: usize, cols: usize, value: f64) -> Self {
        Self::new([rows, cols], vec![value; rows * cols])
    }

    pub fn from_array(array: &Array2<f64>) -> Self {
        let (rows, cols) = array.dim();
        Self::new([rows, cols], array.iter().copied().collect())
    }

    /// Convert to an owned array, checking the declared shape.
    pub fn to_array(&self) -> Result<Array2<f64>, String> {
        let [rows, cols] = self.shape;
        Array2::from_shape_vec((rows, cols), self.data.clone()).map_err(|_| {
            format!(
                "image declares shape {rows}x{cols} but carries {} values",
                self.data.len()
            )
        })
    }
}

/// Pixel mask; non-zero entries are excluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskFrame {
    pub shape: [usize; 2],
    pub data: Vec<u8>,
}

impl MaskFrame {
    pub fn from_array(mask: &Array2<bool>) -> Self {
        let (rows, cols) = mask.dim();
        Self {
            shape: [rows, cols],
            data: mask.iter().map(|&m| u8::from(m)).collect(),
        }
    }

    pub fn to_array(&self) -> Result<Array2<bool>, String> {
        let [rows, cols] = self.shape;
        let flags = self.data.iter().map(|&v| v != 0).collect();
        Array2::from_shape_vec((rows, cols), flags).map_err(|_| {
            format!(
                "mask declares shape {rows}x{cols} but carries {} values",
                self.data.len()
            )
        })
    }
}

/// Dark-frame reference with the exposure it was taken at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DarkFrame {
    pub image: ImageFrame,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure_time: Option<f64>,
}
