//! Direction-restricted file assets.
//!
//! An [`Asset`] binds a logical name to a path template, a handler and the
//! shared [`NameTracker`]. The direction is part of the type:
//!
//! * [`Asset<Input>`] only exposes [`Asset::read`],
//! * [`Asset<Output>`] only exposes [`Asset::write`].
//!
//! A stage can therefore never overwrite a file it depends on, nor read a file
//! it has not declared as an input. Code that handles assets generically goes
//! through [`AnyAsset`], which performs the same check at runtime and fails
//! with [`AssetError::Direction`].

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::error::{Access, AssetError, ConfigError};
use crate::handler::{AssetHandler, Payload};
use crate::namer::NameTracker;

mod sealed {
    pub trait Sealed {}
}

/// Marker for the two asset directions.
pub trait Direction: sealed::Sealed + Send + Sync + 'static {
    const ACCESS: Access;
}

/// Marker type for assets a stage consumes.
#[derive(Debug, Clone, Copy)]
pub struct Input;

/// Marker type for assets a stage produces.
#[derive(Debug, Clone, Copy)]
pub struct Output;

impl sealed::Sealed for Input {}
impl sealed::Sealed for Output {}

impl Direction for Input {
    const ACCESS: Access = Access::Read;
}

impl Direction for Output {
    const ACCESS: Access = Access::Write;
}

#[derive(Clone)]
struct AssetCore {
    name: String,
    handler: Arc<dyn AssetHandler>,
    template: String,
    bound: BTreeMap<String, String>,
}

/// A logical data item bound to a path template and a handler.
pub struct Asset<D: Direction> {
    core: Arc<AssetCore>,
    names: NameTracker,
    _direction: PhantomData<D>,
}

impl<D: Direction> Clone for Asset<D> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            names: self.names.clone(),
            _direction: PhantomData,
        }
    }
}

impl<D: Direction> Asset<D> {
    pub fn new(
        name: impl Into<String>,
        handler: Arc<dyn AssetHandler>,
        template: impl Into<String>,
        names: &NameTracker,
    ) -> Self {
        Self {
            core: Arc::new(AssetCore {
                name: name.into(),
                handler,
                template: template.into(),
                bound: BTreeMap::new(),
            }),
            names: names.clone(),
            _direction: PhantomData,
        }
    }

    /// Pins `key` to `value` for this asset only, overriding the shared
    /// context. Used to resolve `{stage}` into the producing stage's
    /// directory.
    pub fn bind(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.core)
            .bound
            .insert(key.into(), value.into());
        self
    }

    /// The same asset observing another naming context.
    pub fn rebind(&self, names: &NameTracker) -> Self {
        Self {
            core: self.core.clone(),
            names: names.clone(),
            _direction: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn template(&self) -> &str {
        &self.core.template
    }

    pub fn handler(&self) -> &Arc<dyn AssetHandler> {
        &self.core.handler
    }

    /// Entries pinned with [`Asset::bind`].
    pub fn bound(&self) -> &BTreeMap<String, String> {
        &self.core.bound
    }

    pub fn names(&self) -> &NameTracker {
        &self.names
    }

    pub fn access(&self) -> Access {
        D::ACCESS
    }

    /// Renders the path against the context as it is right now. The result is
    /// never cached, so it follows every scope the caller enters.
    pub fn path(&self) -> Result<Utf8PathBuf, ConfigError> {
        self.names
            .render_with(&self.core.template, &self.core.bound)
            .map(Utf8PathBuf::from)
    }
}

impl Asset<Input> {
    /// Reads the file at the current path through the handler.
    pub fn read(&self) -> Result<Payload, AssetError> {
        let path = self.path()?;
        tracing::debug!(asset = self.name(), %path, "read");
        self.core.handler.read(&path)
    }
}

impl Asset<Output> {
    /// Writes `data` to the current path through the handler.
    pub fn write(&self, data: impl Into<Payload>) -> Result<(), AssetError> {
        let path = self.path()?;
        tracing::debug!(asset = self.name(), %path, "write");
        self.core.handler.write(&path, &data.into())
    }
}

impl<D: Direction> std::fmt::Debug for Asset<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Asset")
            .field("name", &self.core.name)
            .field("access", &D::ACCESS)
            .field("handler", &self.core.handler.name())
            .field("template", &self.core.template)
            .finish()
    }
}

/// Either kind of asset, for code that does not know the direction statically.
#[derive(Debug, Clone, Copy)]
pub enum AnyAsset<'a> {
    Input(&'a Asset<Input>),
    Output(&'a Asset<Output>),
}

impl<'a> AnyAsset<'a> {
    pub fn name(&self) -> &'a str {
        match *self {
            AnyAsset::Input(asset) => asset.name(),
            AnyAsset::Output(asset) => asset.name(),
        }
    }

    pub fn access(&self) -> Access {
        match *self {
            AnyAsset::Input(_) => Access::Read,
            AnyAsset::Output(_) => Access::Write,
        }
    }

    pub fn template(&self) -> &'a str {
        match *self {
            AnyAsset::Input(asset) => asset.template(),
            AnyAsset::Output(asset) => asset.template(),
        }
    }

    pub fn path(&self) -> Result<Utf8PathBuf, ConfigError> {
        match *self {
            AnyAsset::Input(asset) => asset.path(),
            AnyAsset::Output(asset) => asset.path(),
        }
    }

    pub fn read(&self) -> Result<Payload, AssetError> {
        match *self {
            AnyAsset::Input(asset) => asset.read(),
            AnyAsset::Output(asset) => Err(AssetError::Direction {
                asset: asset.name().to_string(),
                access: Access::Read,
            }),
        }
    }

    pub fn write(&self, data: impl Into<Payload>) -> Result<(), AssetError> {
        match *self {
            AnyAsset::Input(asset) => Err(AssetError::Direction {
                asset: asset.name().to_string(),
                access: Access::Write,
            }),
            AnyAsset::Output(asset) => asset.write(data),
        }
    }
}

impl<'a> From<&'a Asset<Input>> for AnyAsset<'a> {
    fn from(value: &'a Asset<Input>) -> Self {
        AnyAsset::Input(value)
    }
}

impl<'a> From<&'a Asset<Output>> for AnyAsset<'a> {
    fn from(value: &'a Asset<Output>) -> Self {
        AnyAsset::Output(value)
    }
}

/// Ordered, name-addressed collection of assets sharing one direction.
pub struct AssetSet<D: Direction> {
    stage: String,
    assets: Vec<Asset<D>>,
}

impl<D: Direction> AssetSet<D> {
    pub(crate) fn new(stage: impl Into<String>, assets: Vec<Asset<D>>) -> Self {
        Self {
            stage: stage.into(),
            assets,
        }
    }

    /// Looks up an asset by name.
    pub fn get(&self, name: &str) -> Result<&Asset<D>, ConfigError> {
        self.assets
            .iter()
            .find(|asset| asset.name() == name)
            .ok_or_else(|| ConfigError::UnknownAsset {
                stage: self.stage.clone(),
                asset: name.to_string(),
            })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Asset<D>> {
        self.assets.iter()
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub(crate) fn rebind(&self, names: &NameTracker) -> Self {
        Self {
            stage: self.stage.clone(),
            assets: self.assets.iter().map(|asset| asset.rebind(names)).collect(),
        }
    }
}

impl<D: Direction> std::ops::Index<&str> for AssetSet<D> {
    type Output = Asset<D>;

    fn index(&self, name: &str) -> &Self::Output {
        match self.get(name) {
            Ok(asset) => asset,
            Err(err) => panic!("{err}"),
        }
    }
}

impl<'a, D: Direction> IntoIterator for &'a AssetSet<D> {
    type Item = &'a Asset<D>;
    type IntoIter = std::slice::Iter<'a, Asset<D>>;

    fn into_iter(self) -> Self::IntoIter {
        self.assets.iter()
    }
}
