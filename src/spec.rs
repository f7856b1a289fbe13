//! Declarative description of a pipeline.
//!
//! The declaration is a mapping from stage keys to [`StageSpec`]s. Declaration
//! order matters: it is the execution order, and a stage may only consume
//! outputs of stages declared before it. Every mapping here therefore keeps
//! the order in which its entries were written.
//!
//! ```yaml
//! ps_setup:
//!   assets_out:
//!     cmb_ps: {handler: text_array, path_template: "{root}/{dataset}/{stage}/ps.txt"}
//!   make_stage_log: true
//! ps2map:
//!   assets_in:
//!     cmb_ps: {stage: ps_setup}
//!   assets_out:
//!     cmb_map: {handler: array, path_template: "{root}/{dataset}/{stage}/{split}/sim{sim:04}/map.cbor"}
//!   splits: [{name: Test, n_sims: 2}]
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A string-keyed map that preserves insertion order and rejects duplicate
/// keys when deserialized.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<T> {
    entries: Vec<(String, T)>,
}

impl<T> Default for OrderedMap<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> OrderedMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry, replacing the value of an existing key in place.
    pub fn insert(&mut self, key: impl Into<String>, value: T) -> &mut Self {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Position of `key` in declaration order.
    pub fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, T> FromIterator<(K, T)> for OrderedMap<T> {
    fn from_iter<I: IntoIterator<Item = (K, T)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<T: Serialize> Serialize for OrderedMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

struct OrderedMapVisitor<T>(PhantomData<T>);

impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<T> {
    type Value = OrderedMap<T>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a mapping with unique string keys")
    }

    fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
        Ok(OrderedMap::new())
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut entries: Vec<(String, T)> = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((key, value)) = access.next_entry::<String, T>()? {
            if entries.iter().any(|(k, _)| *k == key) {
                return Err(serde::de::Error::custom(format!("duplicate key '{key}'")));
            }
            entries.push((key, value));
        }
        Ok(OrderedMap { entries })
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for OrderedMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(OrderedMapVisitor(PhantomData))
    }
}

/// Declaration of a file a stage produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Name of the handler in the [`crate::HandlerRegistry`].
    pub handler: String,
    /// Path template, e.g. `{root}/{dataset}/{stage}/{split}/out.cbor`.
    pub path_template: String,
}

/// Declaration of a file a stage consumes from an earlier stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    /// Key of the producing stage.
    pub stage: String,
    /// Name of the producer's output, when it differs from the input's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
}

/// One iteration split, written either as a bare name or as a mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SplitSpec {
    Name(String),
    Sims {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        n_sims: Option<usize>,
    },
}

impl SplitSpec {
    pub fn name(&self) -> &str {
        match self {
            SplitSpec::Name(name) | SplitSpec::Sims { name, .. } => name,
        }
    }

    pub fn n_sims(&self) -> Option<usize> {
        match self {
            SplitSpec::Name(_) => None,
            SplitSpec::Sims { n_sims, .. } => *n_sims,
        }
    }
}

/// Declaration of a single stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    #[serde(default, skip_serializing_if = "OrderedMap::is_empty")]
    pub assets_out: OrderedMap<OutputSpec>,
    #[serde(default, skip_serializing_if = "OrderedMap::is_empty")]
    pub assets_in: OrderedMap<InputSpec>,
    /// Directory name substituted for `{stage}`; defaults to the stage key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub splits: Vec<SplitSpec>,
    #[serde(default)]
    pub make_stage_log: bool,
    /// Any other keys, kept for stage logic to interpret.
    #[serde(flatten)]
    pub flags: BTreeMap<String, serde_json::Value>,
}

impl StageSpec {
    pub fn output(mut self, name: &str, handler: &str, path_template: &str) -> Self {
        self.assets_out.insert(
            name,
            OutputSpec {
                handler: handler.to_string(),
                path_template: path_template.to_string(),
            },
        );
        self
    }

    pub fn input(mut self, name: &str, stage: &str) -> Self {
        self.assets_in.insert(
            name,
            InputSpec {
                stage: stage.to_string(),
                asset: None,
            },
        );
        self
    }

    pub fn input_as(mut self, name: &str, stage: &str, asset: &str) -> Self {
        self.assets_in.insert(
            name,
            InputSpec {
                stage: stage.to_string(),
                asset: Some(asset.to_string()),
            },
        );
        self
    }

    pub fn dir_name(mut self, dir_name: &str) -> Self {
        self.dir_name = Some(dir_name.to_string());
        self
    }

    pub fn split(mut self, name: &str, n_sims: Option<usize>) -> Self {
        self.splits.push(SplitSpec::Sims {
            name: name.to_string(),
            n_sims,
        });
        self
    }

    pub fn make_stage_log(mut self, enabled: bool) -> Self {
        self.make_stage_log = enabled;
        self
    }
}

/// The whole pipeline: stages in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineSpec {
    pub stages: OrderedMap<StageSpec>,
}

impl PipelineSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage, keeping declaration order.
    pub fn stage(mut self, key: &str, spec: StageSpec) -> Self {
        self.stages.insert(key, spec);
        self
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn to_yaml_string(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
zeta_stage:
  assets_out:
    second: {handler: config, path_template: "{root}/b.yaml"}
    first: {handler: plain_text, path_template: "{root}/a.txt"}
  splits: [Train, {name: Test, n_sims: 3}]
  make_stage_log: true
  nside: 512
alpha_stage:
  assets_in:
    first: {stage: zeta_stage}
    renamed: {stage: zeta_stage, asset: second}
  dir_name: Alpha
"#;

    #[test]
    fn test_preserves_order() {
        let spec = PipelineSpec::from_yaml_str(YAML).unwrap();
        let keys: Vec<_> = spec.stages.keys().collect();
        assert_eq!(keys, vec!["zeta_stage", "alpha_stage"]);

        let zeta = spec.stages.get("zeta_stage").unwrap();
        let outputs: Vec<_> = zeta.assets_out.keys().collect();
        assert_eq!(outputs, vec!["second", "first"]);
    }

    #[test]
    fn test_fields() {
        let spec = PipelineSpec::from_yaml_str(YAML).unwrap();
        let zeta = spec.stages.get("zeta_stage").unwrap();
        assert!(zeta.make_stage_log);
        assert_eq!(zeta.splits[0], SplitSpec::Name("Train".into()));
        assert_eq!(zeta.splits[1].n_sims(), Some(3));
        assert_eq!(zeta.flags.get("nside"), Some(&serde_json::json!(512)));

        let alpha = spec.stages.get("alpha_stage").unwrap();
        assert_eq!(alpha.dir_name.as_deref(), Some("Alpha"));
        assert!(!alpha.make_stage_log);
        assert_eq!(
            alpha.assets_in.get("renamed").unwrap().asset.as_deref(),
            Some("second")
        );
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let yaml = "a:\n  dir_name: x\na:\n  dir_name: y\n";
        assert!(PipelineSpec::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_yaml_round_trip_keeps_order() {
        let spec = PipelineSpec::from_yaml_str(YAML).unwrap();
        let text = spec.to_yaml_string().unwrap();
        assert!(text.find("zeta_stage").unwrap() < text.find("alpha_stage").unwrap());
        assert_eq!(PipelineSpec::from_yaml_str(&text).unwrap(), spec);
    }

    #[test]
    fn test_builder() {
        let spec = PipelineSpec::new()
            .stage(
                "ps_setup",
                StageSpec::default().output("cmb_ps", "text_array", "{root}/ps.txt"),
            )
            .stage("ps2map", StageSpec::default().input("cmb_ps", "ps_setup"));
        assert_eq!(spec.stages.position("ps2map"), Some(1));
    }
}
