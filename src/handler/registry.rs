use std::any::TypeId;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::handler::AssetHandler;

/// Constructor producing a fresh handler instance.
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn AssetHandler> + Send + Sync>;

#[derive(Clone)]
struct Entry {
    factory: HandlerFactory,
    /// Type of the function item or closure the factory was made from.
    id: TypeId,
}

/// Default constructor for handlers without configuration.
pub fn make<H>() -> Arc<dyn AssetHandler>
where
    H: AssetHandler + Default + 'static,
{
    Arc::new(H::default())
}

/// Mapping from handler names, as used in the pipeline declaration, to
/// handler constructors.
///
/// Registration has to happen before the pipeline is resolved; names that are
/// still unknown at that point fail resolution.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    map: BTreeMap<String, Entry>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in handler.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_builtins();
        registry
    }

    fn register_builtins(&mut self) {
        use crate::handler::*;

        self.insert(PlainTextHandler::NAME, make::<PlainTextHandler>);
        self.insert(TextArrayHandler::NAME, make::<TextArrayHandler>);
        self.insert(ConfigHandler::NAME, make::<ConfigHandler>);
        self.insert(ArrayHandler::NAME, make::<ArrayHandler>);
        self.insert(SkyMapHandler::NAME, make::<SkyMapHandler>);
        #[cfg(feature = "image")]
        self.insert(FigureHandler::NAME, make::<FigureHandler>);
    }

    fn insert<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn AssetHandler> + Send + Sync + 'static,
    {
        self.map.insert(name.to_string(), Entry::new(factory));
    }

    /// Registers `factory` under `name`.
    ///
    /// Constructors are told apart by type: every function item, every
    /// instantiation of [`make`] and every closure has its own. Registering
    /// the same constructor twice is a no-op; registering a different one
    /// under a taken name fails. A plain `fn` pointer carries no such
    /// identity, so pass the function item itself.
    pub fn register<F>(
        &mut self,
        name: impl Into<String>,
        factory: F,
    ) -> Result<&mut Self, ConfigError>
    where
        F: Fn() -> Arc<dyn AssetHandler> + Send + Sync + 'static,
    {
        let name = name.into();
        let entry = Entry::new(factory);
        if let Some(existing) = self.map.get(&name) {
            if existing.id != entry.id {
                return Err(ConfigError::DuplicateHandler { name });
            }
            return Ok(self);
        }

        tracing::debug!("Registered handler '{name}'");
        self.map.insert(name, entry);
        Ok(self)
    }

    /// Looks up the constructor registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<HandlerFactory, ConfigError> {
        self.map
            .get(name)
            .map(|entry| entry.factory.clone())
            .ok_or_else(|| ConfigError::UnknownHandler {
                name: name.to_string(),
            })
    }

    /// Builds a new handler instance for `name`.
    pub fn create(&self, name: &str) -> Result<Arc<dyn AssetHandler>, ConfigError> {
        self.resolve(name).map(|factory| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// Registered names, in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.map.keys()).finish()
    }
}

impl Entry {
    fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Arc<dyn AssetHandler> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            id: TypeId::of::<F>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::PlainTextHandler;

    fn text() -> Arc<dyn AssetHandler> {
        Arc::new(PlainTextHandler)
    }

    fn other() -> Arc<dyn AssetHandler> {
        Arc::new(crate::handler::ConfigHandler)
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = HandlerRegistry::new();
        registry.register("txt", text).unwrap();
        assert_eq!(registry.create("txt").unwrap().name(), "plain_text");
        assert!(registry.contains("txt"));
    }

    #[test]
    fn test_register_same_twice() {
        let mut registry = HandlerRegistry::new();
        registry.register("txt", text).unwrap();
        assert!(registry.register("txt", text).is_ok());
    }

    #[test]
    fn test_register_same_generic_constructor_twice() {
        let mut registry = HandlerRegistry::with_builtins();
        assert!(registry.register("plain_text", make::<PlainTextHandler>).is_ok());
        assert!(registry.register("text_again", make::<PlainTextHandler>).is_ok());
        assert!(registry.register("text_again", make::<PlainTextHandler>).is_ok());

        let err = registry
            .register("text_again", make::<crate::handler::ConfigHandler>)
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateHandler { .. }));
    }

    #[test]
    fn test_register_closure() {
        let mut registry = HandlerRegistry::new();
        registry.register("txt", || text()).unwrap();
        assert_eq!(registry.create("txt").unwrap().name(), "plain_text");

        // A second closure is a different constructor, even with the same body.
        let err = registry.register("txt", || text()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateHandler { .. }));
    }

    #[test]
    fn test_register_conflict() {
        let mut registry = HandlerRegistry::new();
        registry.register("txt", text).unwrap();
        let err = registry.register("txt", other).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateHandler { name } if name == "txt"));
    }

    #[test]
    fn test_unknown_handler() {
        let registry = HandlerRegistry::with_builtins();
        let err = registry.resolve("fits_map").err().unwrap();
        assert!(matches!(err, ConfigError::UnknownHandler { name } if name == "fits_map"));
    }

    #[test]
    fn test_builtins() {
        let registry = HandlerRegistry::with_builtins();
        for name in ["plain_text", "text_array", "config", "array", "sky_map"] {
            assert!(registry.contains(name), "missing {name}");
        }
    }
}
