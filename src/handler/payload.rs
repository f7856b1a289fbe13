use ndarray::{Array, Array1, ArrayD, Dimension};
use serde::{Deserialize, Serialize};

use crate::error::AssetError;

/// Data exchanged between stage logic and asset handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Free-form UTF-8 text.
    Text(String),
    /// Structured configuration data.
    Config(serde_json::Value),
    /// Dense numeric array.
    Array(NumericArray),
    /// Pixelized full-sky map.
    Map(SkyMap),
    /// Raster figure.
    Figure(Figure),
}

impl Payload {
    /// Name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Text(_) => "text",
            Payload::Config(_) => "config",
            Payload::Array(_) => "array",
            Payload::Map(_) => "map",
            Payload::Figure(_) => "figure",
        }
    }

    fn mismatch(&self, expected: &'static str) -> AssetError {
        AssetError::PayloadKind {
            expected,
            found: self.kind(),
        }
    }

    pub fn into_text(self) -> Result<String, AssetError> {
        match self {
            Payload::Text(text) => Ok(text),
            other => Err(other.mismatch("text")),
        }
    }

    pub fn into_config(self) -> Result<serde_json::Value, AssetError> {
        match self {
            Payload::Config(value) => Ok(value),
            other => Err(other.mismatch("config")),
        }
    }

    pub fn into_array(self) -> Result<NumericArray, AssetError> {
        match self {
            Payload::Array(array) => Ok(array),
            other => Err(other.mismatch("array")),
        }
    }

    pub fn into_map(self) -> Result<SkyMap, AssetError> {
        match self {
            Payload::Map(map) => Ok(map),
            other => Err(other.mismatch("map")),
        }
    }

    pub fn into_figure(self) -> Result<Figure, AssetError> {
        match self {
            Payload::Figure(figure) => Ok(figure),
            other => Err(other.mismatch("figure")),
        }
    }

    pub fn as_text(&self) -> Result<&str, AssetError> {
        match self {
            Payload::Text(text) => Ok(text),
            other => Err(other.mismatch("text")),
        }
    }

    pub fn as_config(&self) -> Result<&serde_json::Value, AssetError> {
        match self {
            Payload::Config(value) => Ok(value),
            other => Err(other.mismatch("config")),
        }
    }

    pub fn as_array(&self) -> Result<&NumericArray, AssetError> {
        match self {
            Payload::Array(array) => Ok(array),
            other => Err(other.mismatch("array")),
        }
    }

    pub fn as_map(&self) -> Result<&SkyMap, AssetError> {
        match self {
            Payload::Map(map) => Ok(map),
            other => Err(other.mismatch("map")),
        }
    }

    pub fn as_figure(&self) -> Result<&Figure, AssetError> {
        match self {
            Payload::Figure(figure) => Ok(figure),
            other => Err(other.mismatch("figure")),
        }
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Config(value)
    }
}

impl<D: Dimension> From<Array<f64, D>> for Payload {
    fn from(value: Array<f64, D>) -> Self {
        Payload::Array(value.into_dyn())
    }
}

impl From<Vec<f64>> for Payload {
    fn from(value: Vec<f64>) -> Self {
        Payload::Array(Array1::from_vec(value).into_dyn())
    }
}

impl From<SkyMap> for Payload {
    fn from(value: SkyMap) -> Self {
        Payload::Map(value)
    }
}

impl From<Figure> for Payload {
    fn from(value: Figure) -> Self {
        Payload::Figure(value)
    }
}

/// Dense `f64` array of any dimension.
pub type NumericArray = ArrayD<f64>;

/// Pixel ordering of a [`SkyMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ordering {
    Ring,
    Nested,
}

/// A HEALPix-style full-sky map: one or more fields (e.g. I, Q, U) of
/// `12 * nside^2` pixels each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkyMap {
    pub nside: u32,
    pub ordering: Ordering,
    pub unit: Option<String>,
    pub fields: Vec<Vec<f64>>,
}

impl SkyMap {
    /// Number of pixels in each field for the given resolution, or `None`
    /// when it does not fit in `usize`.
    pub fn npix(nside: u32) -> Option<usize> {
        let nside = usize::try_from(nside).ok()?;
        nside.checked_mul(nside)?.checked_mul(12)
    }

    /// A map with `n_fields` zeroed fields, or `None` when `nside` is too
    /// large to address.
    pub fn zeros(nside: u32, n_fields: usize) -> Option<Self> {
        Some(Self {
            nside,
            ordering: Ordering::Ring,
            unit: None,
            fields: vec![vec![0.0; Self::npix(nside)?]; n_fields],
        })
    }

    /// Checks the structural invariants, returning a description of the first
    /// violated one.
    pub fn validate(&self) -> Result<(), String> {
        if self.nside == 0 || !self.nside.is_power_of_two() {
            return Err(format!("nside {} is not a power of two", self.nside));
        }
        if self.fields.is_empty() {
            return Err("map has no fields".to_string());
        }

        let Some(npix) = Self::npix(self.nside) else {
            return Err(format!("nside {} is too large", self.nside));
        };
        for (i, field) in self.fields.iter().enumerate() {
            if field.len() != npix {
                return Err(format!(
                    "field {i} has {} pixels, expected {npix} for nside {}",
                    field.len(),
                    self.nside
                ));
            }
        }

        Ok(())
    }
}

/// 8-bit grayscale raster.
#[derive(Debug, Clone, PartialEq)]
pub struct Figure {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Figure {
    /// Rescales `values` linearly onto 0..=255, row-major with the given width.
    pub fn from_values(width: u32, values: &[f64]) -> Self {
        let (min, max) = values
            .iter()
            .fold((f64::MAX, f64::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let span = if max > min { max - min } else { 1.0 };
        let width = width.max(1);

        Self {
            width,
            height: values.len().div_ceil(width as usize) as u32,
            pixels: values
                .iter()
                .map(|v| (255.0 * (v - min) / span).round() as u8)
                .chain(std::iter::repeat(0))
                .take(values.len().div_ceil(width as usize) * width as usize)
                .collect(),
        }
    }
}
