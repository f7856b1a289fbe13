use camino::Utf8Path;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::AssetError;
use crate::handler::{AssetHandler, NumericArray, Payload, SkyMap};
use crate::io;

fn to_cbor<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), AssetError> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer).map_err(|e| AssetError::serialize(path, e))?;
    io::write_bytes(path, buffer)
}

fn from_cbor<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, AssetError> {
    let bytes = io::read_bytes(path)?;
    ciborium::from_reader(bytes.as_slice()).map_err(|e| AssetError::deserialize(path, e))
}

/// Dense numeric arrays stored as CBOR `{v, dim, data}` records, the serde
/// layout of `ndarray`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArrayHandler;

impl ArrayHandler {
    pub const NAME: &'static str = "array";
}

impl AssetHandler for ArrayHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn read(&self, path: &Utf8Path) -> Result<Payload, AssetError> {
        // shape and data length are checked against each other while decoding
        let array: NumericArray = from_cbor(path)?;
        Ok(Payload::Array(array))
    }

    fn write(&self, path: &Utf8Path, data: &Payload) -> Result<(), AssetError> {
        to_cbor(path, data.as_array()?)
    }
}

/// Full-sky maps stored as CBOR records.
///
/// Maps are validated in both directions, so a map with the wrong pixel count
/// for its `nside` is never written and never read back.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkyMapHandler;

impl SkyMapHandler {
    pub const NAME: &'static str = "sky_map";
}

impl AssetHandler for SkyMapHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn read(&self, path: &Utf8Path) -> Result<Payload, AssetError> {
        let map: SkyMap = from_cbor(path)?;
        map.validate()
            .map_err(|reason| AssetError::deserialize(path, reason))?;
        Ok(Payload::Map(map))
    }

    fn write(&self, path: &Utf8Path, data: &Payload) -> Result<(), AssetError> {
        let map = data.as_map()?;
        map.validate()
            .map_err(|reason| AssetError::serialize(path, reason))?;
        to_cbor(path, map)
    }
}
