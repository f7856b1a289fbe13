use std::fmt::Write;

use camino::Utf8Path;
use ndarray::{ArrayD, Ix2, IxDyn};

use crate::error::AssetError;
use crate::handler::{AssetHandler, NumericArray, Payload};
use crate::io;

/// UTF-8 text files.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextHandler;

impl PlainTextHandler {
    pub const NAME: &'static str = "plain_text";
}

impl AssetHandler for PlainTextHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn read(&self, path: &Utf8Path) -> Result<Payload, AssetError> {
        io::read_text(path).map(Payload::Text)
    }

    fn write(&self, path: &Utf8Path, data: &Payload) -> Result<(), AssetError> {
        io::write_bytes(path, data.as_text()?)
    }
}

/// Whitespace-separated numeric tables, one row per line.
///
/// Lines starting with `#` and blank lines are ignored. A file with a single
/// value per line reads back as a one-dimensional array, anything wider as a
/// two-dimensional one. Values are written in the shortest exponent notation
/// that reads back to the same `f64`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextArrayHandler;

impl TextArrayHandler {
    pub const NAME: &'static str = "text_array";
}

fn parse_table(path: &Utf8Path, text: &str) -> Result<NumericArray, AssetError> {
    let mut width = None;
    let mut rows = 0;
    let mut data = Vec::new();

    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let before = data.len();
        for token in line.split_whitespace() {
            let value = token.parse::<f64>().map_err(|e| {
                AssetError::deserialize(path, format!("line {}: '{token}': {e}", n + 1))
            })?;
            data.push(value);
        }

        let count = data.len() - before;
        match width {
            None => width = Some(count),
            Some(w) if w != count => {
                return Err(AssetError::deserialize(
                    path,
                    format!("line {} has {count} columns, expected {w}", n + 1),
                ));
            }
            Some(_) => {}
        }
        rows += 1;
    }

    let shape = match width {
        None => vec![0],
        Some(1) => vec![rows],
        Some(w) => vec![rows, w],
    };

    ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|e| AssetError::deserialize(path, e))
}

fn push_row<'a>(out: &mut String, row: impl Iterator<Item = &'a f64>) {
    for (i, value) in row.enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{value:e}");
    }
    out.push('\n');
}

impl AssetHandler for TextArrayHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn read(&self, path: &Utf8Path) -> Result<Payload, AssetError> {
        let text = io::read_text(path)?;
        parse_table(path, &text).map(Payload::Array)
    }

    fn write(&self, path: &Utf8Path, data: &Payload) -> Result<(), AssetError> {
        let array = data.as_array()?;
        if array.ndim() > 2 {
            return Err(AssetError::serialize(
                path,
                format!("cannot write {}-dimensional array as text", array.ndim()),
            ));
        }

        let mut out = String::new();
        match array.view().into_dimensionality::<Ix2>() {
            Ok(table) => table.rows().into_iter().for_each(|row| push_row(&mut out, row.iter())),
            Err(_) => array.iter().for_each(|value| push_row(&mut out, std::iter::once(value))),
        }

        io::write_bytes(path, out)
    }
}
