use camino::Utf8Path;

use crate::error::AssetError;
use crate::handler::{AssetHandler, Payload};
use crate::io;

/// Structured configuration files.
///
/// The format follows the file extension: `.yaml` and `.yml` are YAML,
/// anything else is JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigHandler;

impl ConfigHandler {
    pub const NAME: &'static str = "config";
}

fn is_yaml(path: &Utf8Path) -> bool {
    matches!(path.extension(), Some("yaml" | "yml"))
}

impl AssetHandler for ConfigHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn read(&self, path: &Utf8Path) -> Result<Payload, AssetError> {
        let text = io::read_text(path)?;

        let value = if is_yaml(path) {
            serde_yaml::from_str::<serde_json::Value>(&text)
                .map_err(|e| AssetError::deserialize(path, e))?
        } else {
            serde_json::from_str::<serde_json::Value>(&text)
                .map_err(|e| AssetError::deserialize(path, e))?
        };

        Ok(Payload::Config(value))
    }

    fn write(&self, path: &Utf8Path, data: &Payload) -> Result<(), AssetError> {
        let value = data.as_config()?;

        let text = if is_yaml(path) {
            serde_yaml::to_string(value).map_err(|e| AssetError::serialize(path, e))?
        } else {
            serde_json::to_string_pretty(value).map_err(|e| AssetError::serialize(path, e))?
        };

        io::write_bytes(path, text)
    }
}
