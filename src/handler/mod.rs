//! Serialization strategies for assets.
//!
//! An [`AssetHandler`] knows how to turn a [`Payload`] into a file and back
//! for one file format. Handlers are stateless with respect to the pipeline:
//! the same handler instance is shared by a producing stage's output asset and
//! every consuming stage's input asset.
//!
//! Handlers are looked up by name through a [`HandlerRegistry`], since the
//! pipeline declaration picks them by string.

mod array;
mod config;
#[cfg(feature = "image")]
mod figure;
mod payload;
mod registry;
mod text;

use camino::Utf8Path;

use crate::error::{Access, AssetError};

pub use array::{ArrayHandler, SkyMapHandler};
pub use config::ConfigHandler;
#[cfg(feature = "image")]
pub use figure::FigureHandler;
pub use payload::{Figure, NumericArray, Ordering, Payload, SkyMap};
pub use registry::{HandlerFactory, HandlerRegistry, make};
pub use text::{PlainTextHandler, TextArrayHandler};

/// Directions a handler supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub read: bool,
    pub write: bool,
}

impl Capabilities {
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
    };
    pub const READ_ONLY: Self = Self {
        read: true,
        write: false,
    };
    pub const WRITE_ONLY: Self = Self {
        read: false,
        write: true,
    };

    pub fn allows(&self, access: Access) -> bool {
        match access {
            Access::Read => self.read,
            Access::Write => self.write,
        }
    }
}

/// Serializer and deserializer for one file format.
///
/// A handler may support a single direction, in which case the other method
/// keeps its default implementation and [`AssetHandler::capabilities`] says so.
/// Implementations of `write` create the destination directory tree first and
/// report storage failures as [`AssetError::Io`]. Implementations of `read`
/// report a missing file as [`AssetError::NotFound`] and malformed content as
/// [`AssetError::Deserialize`].
pub trait AssetHandler: Send + Sync {
    /// Name the handler is registered under.
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::READ_WRITE
    }

    fn read(&self, path: &Utf8Path) -> Result<Payload, AssetError> {
        let _ = path;
        Err(AssetError::Unsupported {
            handler: self.name().to_string(),
            access: Access::Read,
        })
    }

    fn write(&self, path: &Utf8Path, data: &Payload) -> Result<(), AssetError> {
        let _ = (path, data);
        Err(AssetError::Unsupported {
            handler: self.name().to_string(),
            access: Access::Write,
        })
    }
}

impl std::fmt::Debug for dyn AssetHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AssetHandler({})", self.name())
    }
}
