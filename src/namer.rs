//! Path templating against a shared, scope-restorable naming context.
//!
//! A [`NameTracker`] owns the context used to render path templates such as
//! `{root}/{dataset}/{stage}/{split}/sim{sim:04}/map.cbor`. The context is made
//! of an immutable base plus a stack of scope layers. Layers are only ever
//! added through [`NameTracker::scoped_set`] or
//! [`NameTracker::scoped_set_many`], and every layer is removed again when the
//! returned [`ScopeGuard`] is dropped, including during unwinding or early
//! returns through `?`.
//!
//! A tracker is a cheap handle. Cloning it yields another handle to the *same*
//! context, which is how every asset of a pipeline run observes one evolving
//! context. To get an independent copy, e.g. for a parallel worker, use
//! [`NameTracker::fork`].

use std::collections::BTreeMap;
use std::fmt::{Display, Write};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::ConfigError;

struct Layer {
    id: u64,
    values: BTreeMap<String, String>,
}

#[derive(Default)]
struct Layers {
    base: BTreeMap<String, String>,
    scopes: Vec<Layer>,
    next_id: u64,
}

impl Layers {
    fn get(&self, key: &str) -> Option<&str> {
        self.scopes
            .iter()
            .rev()
            .find_map(|layer| layer.values.get(key))
            .or_else(|| self.base.get(key))
            .map(String::as_str)
    }

    fn merged(&self) -> BTreeMap<String, String> {
        let mut merged = self.base.clone();
        for layer in &self.scopes {
            merged.extend(layer.values.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }
}

/// Shared naming context used to render path templates.
#[derive(Clone, Default)]
pub struct NameTracker {
    inner: Arc<RwLock<Layers>>,
}

impl NameTracker {
    /// Creates a tracker whose base context holds the given entries.
    pub fn new<K, V>(initial: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Display,
    {
        let base = initial
            .into_iter()
            .map(|(k, v)| (k.into(), v.to_string()))
            .collect();

        Self {
            inner: Arc::new(RwLock::new(Layers {
                base,
                ..Default::default()
            })),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Layers> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Layers> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current value of `key`, taking every active scope into account.
    pub fn get(&self, key: &str) -> Option<String> {
        self.read().get(key).map(str::to_string)
    }

    /// Whether `key` currently resolves to a value.
    pub fn contains(&self, key: &str) -> bool {
        self.read().get(key).is_some()
    }

    /// The merged current context, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.read().merged()
    }

    /// Whether both handles point to the same context.
    pub fn same_context(&self, other: &NameTracker) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns an independent tracker whose base is the current merged
    /// context. Scopes entered on the fork never affect this tracker.
    pub fn fork(&self) -> NameTracker {
        NameTracker {
            inner: Arc::new(RwLock::new(Layers {
                base: self.snapshot(),
                ..Default::default()
            })),
        }
    }

    /// Overrides a single key until the returned guard is dropped.
    pub fn scoped_set(&self, key: impl Into<String>, value: impl Display) -> ScopeGuard {
        self.scoped_set_many([(key.into(), value.to_string())])
    }

    /// Overrides several keys at once until the returned guard is dropped.
    ///
    /// The overrides are applied as one layer, so they become visible together
    /// and are reverted together.
    pub fn scoped_set_many<K, V>(&self, values: impl IntoIterator<Item = (K, V)>) -> ScopeGuard
    where
        K: Into<String>,
        V: Display,
    {
        let values: BTreeMap<String, String> = values
            .into_iter()
            .map(|(k, v)| (k.into(), v.to_string()))
            .collect();

        let mut layers = self.write();
        let id = layers.next_id;
        layers.next_id += 1;
        layers.scopes.push(Layer { id, values });

        ScopeGuard {
            tracker: self.clone(),
            id,
        }
    }

    fn pop_scope(&self, id: u64) {
        let mut layers = self.write();
        if let Some(pos) = layers.scopes.iter().rposition(|layer| layer.id == id) {
            layers.scopes.remove(pos);
        }
    }

    /// Renders `template` with the current context.
    ///
    /// Fails with [`ConfigError::MissingContextKey`] on the first token without
    /// a value; nothing is returned in that case.
    pub fn render(&self, template: &str) -> Result<String, ConfigError> {
        self.render_with(template, &BTreeMap::new())
    }

    /// Renders `template` with `bound` entries taking precedence over the
    /// current context.
    pub fn render_with(
        &self,
        template: &str,
        bound: &BTreeMap<String, String>,
    ) -> Result<String, ConfigError> {
        let layers = self.read();
        let lookup = |key: &str| bound.get(key).map(String::as_str).or_else(|| layers.get(key));

        render_template(template, lookup, false)
    }

    /// Renders what can be rendered and leaves unknown tokens untouched.
    pub fn render_partial(
        &self,
        template: &str,
        bound: &BTreeMap<String, String>,
    ) -> Result<String, ConfigError> {
        let layers = self.read();
        let lookup = |key: &str| bound.get(key).map(String::as_str).or_else(|| layers.get(key));

        render_template(template, lookup, true)
    }
}

impl std::fmt::Debug for NameTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.snapshot()).finish()
    }
}

/// Keeps a scope layer alive. Dropping it restores the context.
///
/// Guards may be dropped in any order; each one removes exactly the layer it
/// created, so an outer scope is never disturbed by an inner one.
#[must_use = "the scope is reverted as soon as the guard is dropped"]
pub struct ScopeGuard {
    tracker: NameTracker,
    id: u64,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.tracker.pop_scope(self.id);
    }
}

/// Parsed `{key:spec}` formatting options.
#[derive(Debug, Default, PartialEq, Eq)]
struct Spec {
    zero: bool,
    width: usize,
}

fn parse_spec(spec: &str) -> Option<Spec> {
    let spec = spec.strip_suffix('d').unwrap_or(spec);
    if spec.is_empty() {
        return Some(Spec::default());
    }
    if !spec.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    Some(Spec {
        zero: spec.starts_with('0'),
        width: spec.parse().ok()?,
    })
}

fn apply_spec(out: &mut String, value: &str, spec: &Spec) {
    let len = value.chars().count();
    if len >= spec.width {
        out.push_str(value);
        return;
    }

    let pad = spec.width - len;
    if spec.zero {
        let (sign, digits) = match value.strip_prefix('-') {
            Some(rest) => ("-", rest),
            None => ("", value),
        };
        out.push_str(sign);
        out.extend(std::iter::repeat_n('0', pad));
        out.push_str(digits);
    } else {
        out.extend(std::iter::repeat_n(' ', pad));
        out.push_str(value);
    }
}

fn malformed(template: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Template {
        template: template.to_string(),
        reason: reason.into(),
    }
}

fn render_template<'a>(
    template: &str,
    lookup: impl Fn(&str) -> Option<&'a str>,
    partial: bool,
) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(template.len() + 32);
    let mut chars = template.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        match c {
            '{' if chars.peek().is_some_and(|&(_, c)| c == '{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek().is_some_and(|&(_, c)| c == '}') => {
                chars.next();
                out.push('}');
            }
            '}' => return Err(malformed(template, format!("unmatched '}}' at {start}"))),
            '{' => {
                let end = loop {
                    match chars.next() {
                        Some((i, '}')) => break i,
                        Some((_, '{')) | None => {
                            return Err(malformed(template, format!("unclosed '{{' at {start}")));
                        }
                        Some(_) => {}
                    }
                };

                let token = &template[start + 1..end];
                let (key, spec) = match token.split_once(':') {
                    Some((key, spec)) => (key, spec),
                    None => (token, ""),
                };

                if key.is_empty() {
                    return Err(malformed(template, format!("empty placeholder at {start}")));
                }

                let spec = parse_spec(spec).ok_or_else(|| {
                    malformed(template, format!("unsupported format '{spec}' for '{key}'"))
                })?;

                match lookup(key) {
                    Some(value) => apply_spec(&mut out, value, &spec),
                    None if partial => {
                        let _ = write!(out, "{{{token}}}");
                    }
                    None => {
                        return Err(ConfigError::MissingContextKey {
                            key: key.to_string(),
                            template: template.to_string(),
                        });
                    }
                }
            }
            c => out.push(c),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> NameTracker {
        NameTracker::new([("root", "/data"), ("dataset", "demo")])
    }

    #[test]
    fn test_render_simple() {
        let names = tracker();
        assert_eq!(
            names.render("{root}/{dataset}/out.txt").unwrap(),
            "/data/demo/out.txt"
        );
        assert_eq!(names.render("no tokens").unwrap(), "no tokens");
    }

    #[test]
    fn test_render_substitutes_once() {
        let names = NameTracker::new([("a", "{b}"), ("b", "oops")]);
        assert_eq!(names.render("x/{a}/y").unwrap(), "x/{b}/y");
    }

    #[test]
    fn test_render_missing_key() {
        let names = tracker();
        let err = names.render("{root}/{split}/x").unwrap_err();
        match err {
            ConfigError::MissingContextKey { key, template } => {
                assert_eq!(key, "split");
                assert_eq!(template, "{root}/{split}/x");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_render_format_spec() {
        let names = NameTracker::new([("sim", "7"), ("neg", "-3")]);
        assert_eq!(names.render("sim{sim:04}").unwrap(), "sim0007");
        assert_eq!(names.render("sim{sim:04d}").unwrap(), "sim0007");
        assert_eq!(names.render("[{sim:3}]").unwrap(), "[  7]");
        assert_eq!(names.render("{neg:04}").unwrap(), "-003");
        assert_eq!(names.render("{sim:1}").unwrap(), "7");
    }

    #[test]
    fn test_render_escapes_and_malformed() {
        let names = tracker();
        assert_eq!(names.render("{{root}}").unwrap(), "{root}");
        assert!(matches!(
            names.render("{root"),
            Err(ConfigError::Template { .. })
        ));
        assert!(matches!(
            names.render("root}"),
            Err(ConfigError::Template { .. })
        ));
        assert!(matches!(names.render("{}"), Err(ConfigError::Template { .. })));
        assert!(matches!(
            names.render("{root:x}"),
            Err(ConfigError::Template { .. })
        ));
    }

    #[test]
    fn test_render_partial() {
        let names = tracker();
        let out = names
            .render_partial("{root}/{split}/sim{sim:04}", &BTreeMap::new())
            .unwrap();
        assert_eq!(out, "/data/{split}/sim{sim:04}");
    }

    #[test]
    fn test_bound_entries_win() {
        let names = NameTracker::new([("stage", "Consumer")]);
        let bound = BTreeMap::from([("stage".to_string(), "Producer".to_string())]);
        assert_eq!(names.render_with("{stage}", &bound).unwrap(), "Producer");
    }

    #[test]
    fn test_scope_restores() {
        let names = tracker();
        let before = names.snapshot();
        {
            let _scope = names.scoped_set("dataset", "other");
            assert_eq!(names.get("dataset").as_deref(), Some("other"));
        }
        assert_eq!(names.snapshot(), before);
    }

    #[test]
    fn test_nested_scopes() {
        let names = tracker();
        let outer = names.scoped_set("a", 1);
        {
            let _inner = names.scoped_set("a", 2);
            assert_eq!(names.get("a").as_deref(), Some("2"));
        }
        assert_eq!(names.get("a").as_deref(), Some("1"));
        drop(outer);
        assert_eq!(names.get("a"), None);
    }

    #[test]
    fn test_out_of_order_release() {
        let names = tracker();
        let outer = names.scoped_set("a", 1);
        let inner = names.scoped_set_many([("a", "2"), ("b", "3")]);
        drop(outer);
        assert_eq!(names.get("a").as_deref(), Some("2"));
        drop(inner);
        assert_eq!(names.get("a"), None);
        assert_eq!(names.get("b"), None);
    }

    #[test]
    fn test_scope_restores_on_error() {
        fn fails(names: &NameTracker) -> Result<String, ConfigError> {
            let _scope = names.scoped_set_many([("split", "Test"), ("sim", "3")]);
            names.render("{split}/{missing}")
        }

        let names = tracker();
        let before = names.snapshot();
        assert!(fails(&names).is_err());
        assert_eq!(names.snapshot(), before);
    }

    #[test]
    fn test_scope_restores_on_panic() {
        let names = tracker();
        let before = names.snapshot();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = names.scoped_set("split", "Train");
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(names.snapshot(), before);
    }

    #[test]
    fn test_shared_and_forked() {
        let names = tracker();
        let shared = names.clone();
        let forked = names.fork();

        let _scope = names.scoped_set("split", "Valid");
        assert_eq!(shared.get("split").as_deref(), Some("Valid"));
        assert_eq!(forked.get("split"), None);
        assert!(shared.same_context(&names));
        assert!(!forked.same_context(&names));
    }
}
