//! Resolution of a [`PipelineSpec`] into concrete stage descriptors.
//!
//! Resolution walks the declaration once, in order. For every stage it:
//!
//! 1. instantiates a handler for each output through the
//!    [`HandlerRegistry`], failing on unknown names,
//! 2. resolves each input to an output of a stage declared strictly earlier,
//!    sharing that output's handler and path template,
//! 3. records a producer → consumer edge in a `petgraph` graph.
//!
//! Every structural problem is reported here, before any stage executes.

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::asset::{Asset, AssetSet, Input, Output};
use crate::error::{Access, ConfigError, GraphError};
use crate::handler::{AssetHandler, HandlerRegistry};
use crate::namer::NameTracker;
use crate::spec::{PipelineSpec, SplitSpec};

/// Key under which a producing stage's directory is bound in asset paths.
pub const STAGE_KEY: &str = "stage";

/// A resolved output declaration.
#[derive(Debug, Clone)]
pub struct OutputDecl {
    pub name: String,
    pub handler_name: String,
    pub handler: Arc<dyn AssetHandler>,
    pub template: String,
}

/// A resolved input declaration, pointing at a concrete earlier output.
#[derive(Debug, Clone)]
pub struct InputDecl {
    pub name: String,
    pub source_stage: String,
    pub source_asset: String,
    /// Directory name of the producing stage, bound to `{stage}`.
    pub source_dir: String,
    pub handler_name: String,
    pub handler: Arc<dyn AssetHandler>,
    pub template: String,
}

/// Everything known about one stage once the graph is resolved.
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    pub key: String,
    pub dir_name: String,
    pub outputs: Vec<OutputDecl>,
    pub inputs: Vec<InputDecl>,
    pub splits: Vec<SplitSpec>,
    pub make_stage_log: bool,
    pub flags: std::collections::BTreeMap<String, serde_json::Value>,
}

impl StageDescriptor {
    /// Builds this stage's output assets against `names`. Each path resolves
    /// `{stage}` to this stage's own directory.
    pub fn assets_out(&self, names: &NameTracker) -> AssetSet<Output> {
        let assets = self
            .outputs
            .iter()
            .map(|decl| {
                Asset::new(&decl.name, decl.handler.clone(), &decl.template, names)
                    .bind(STAGE_KEY, &self.dir_name)
            })
            .collect();

        AssetSet::new(&self.key, assets)
    }

    /// Builds this stage's input assets against `names`. Each path resolves
    /// `{stage}` to the producing stage's directory.
    pub fn assets_in(&self, names: &NameTracker) -> AssetSet<Input> {
        let assets = self
            .inputs
            .iter()
            .map(|decl| {
                Asset::new(&decl.name, decl.handler.clone(), &decl.template, names)
                    .bind(STAGE_KEY, &decl.source_dir)
            })
            .collect();

        AssetSet::new(&self.key, assets)
    }
}

/// The resolved pipeline: descriptors in declaration order plus the data-flow
/// graph between them.
pub struct StageGraph {
    stages: Vec<StageDescriptor>,
    graph: Graph<String, String>,
    index: HashMap<String, NodeIndex>,
}

fn check_capability(
    stage: &str,
    asset: &str,
    handler_name: &str,
    handler: &dyn AssetHandler,
    access: Access,
) -> Result<(), ConfigError> {
    if handler.capabilities().allows(access) {
        Ok(())
    } else {
        Err(ConfigError::HandlerCapability {
            stage: stage.to_string(),
            asset: asset.to_string(),
            handler: handler_name.to_string(),
            access,
        })
    }
}

impl StageGraph {
    /// Resolves the whole declaration, failing fast on the first problem.
    pub fn resolve(spec: &PipelineSpec, registry: &HandlerRegistry) -> Result<Self, ConfigError> {
        let mut stages: Vec<StageDescriptor> = Vec::with_capacity(spec.stages.len());
        let mut graph = Graph::new();
        let mut index = HashMap::new();

        for (position, (key, stage)) in spec.stages.iter().enumerate() {
            let node = graph.add_node(key.to_string());
            index.insert(key.to_string(), node);

            let mut outputs = Vec::with_capacity(stage.assets_out.len());
            for (name, out) in stage.assets_out.iter() {
                let handler = registry.create(&out.handler)?;
                check_capability(key, name, &out.handler, handler.as_ref(), Access::Write)?;

                outputs.push(OutputDecl {
                    name: name.to_string(),
                    handler_name: out.handler.clone(),
                    handler,
                    template: out.path_template.clone(),
                });
            }

            let mut inputs = Vec::with_capacity(stage.assets_in.len());
            for (name, input) in stage.assets_in.iter() {
                let source_asset = input.asset.as_deref().unwrap_or(name);

                if input.stage == key {
                    return Err(GraphError::SelfReference {
                        stage: key.to_string(),
                        asset: source_asset.to_string(),
                    }
                    .into());
                }

                let source = match spec.stages.position(&input.stage) {
                    None => {
                        return Err(GraphError::UnknownStage {
                            stage: key.to_string(),
                            asset: name.to_string(),
                            source_stage: input.stage.clone(),
                        }
                        .into());
                    }
                    Some(p) if p > position => {
                        return Err(GraphError::ForwardReference {
                            stage: key.to_string(),
                            asset: name.to_string(),
                            source_stage: input.stage.clone(),
                        }
                        .into());
                    }
                    Some(p) => &stages[p],
                };

                let produced = source
                    .outputs
                    .iter()
                    .find(|decl| decl.name == source_asset)
                    .ok_or_else(|| ConfigError::UnknownAsset {
                        stage: source.key.clone(),
                        asset: source_asset.to_string(),
                    })?;

                check_capability(
                    key,
                    name,
                    &produced.handler_name,
                    produced.handler.as_ref(),
                    Access::Read,
                )?;

                graph.add_edge(index[&source.key], node, name.to_string());

                inputs.push(InputDecl {
                    name: name.to_string(),
                    source_stage: source.key.clone(),
                    source_asset: source_asset.to_string(),
                    source_dir: source.dir_name.clone(),
                    handler_name: produced.handler_name.clone(),
                    handler: produced.handler.clone(),
                    template: produced.template.clone(),
                });
            }

            stages.push(StageDescriptor {
                key: key.to_string(),
                dir_name: stage.dir_name.clone().unwrap_or_else(|| key.to_string()),
                outputs,
                inputs,
                splits: stage.splits.clone(),
                make_stage_log: stage.make_stage_log,
                flags: stage.flags.clone(),
            });
        }

        // Backward-only edges cannot form a cycle; this guards the invariant.
        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            return Err(GraphError::Cycle(graph[cycle.node_id()].clone()).into());
        }

        tracing::debug!("Resolved {} stages", stages.len());

        Ok(Self {
            stages,
            graph,
            index,
        })
    }

    /// Descriptor of the stage declared under `key`.
    pub fn stage(&self, key: &str) -> Result<&StageDescriptor, ConfigError> {
        self.index
            .get(key)
            .map(|node| &self.stages[node.index()])
            .ok_or_else(|| ConfigError::UnknownStage(key.to_string()))
    }

    /// Stage keys in declaration order, which is also execution order.
    pub fn execution_order(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|stage| stage.key.as_str())
    }

    /// Position of `key` in declaration order.
    pub fn position(&self, key: &str) -> Option<usize> {
        self.index.get(key).map(|node| node.index())
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    /// Keys of the stages `key` reads from.
    pub fn upstream(&self, key: &str) -> Vec<&str> {
        let Some(&node) = self.index.get(key) else {
            return vec![];
        };

        let mut upstream: Vec<_> = self
            .graph
            .neighbors_directed(node, petgraph::Direction::Incoming)
            .map(|n| self.graph[n].as_str())
            .collect();
        upstream.sort_unstable();
        upstream.dedup();
        upstream
    }

    /// Names of every handler bound to some output, sorted and deduplicated.
    pub fn handler_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self
            .stages
            .iter()
            .flat_map(|stage| stage.outputs.iter().map(|decl| decl.handler_name.as_str()))
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

impl std::fmt::Display for StageGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let name = self.graph[index].replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.edge_indices() {
            let Some((source, target)) = self.graph.edge_endpoints(edge) else {
                continue;
            };
            writeln!(
                f,
                "    {:?} -- \"{}\" --> {:?}",
                source.index(),
                self.graph[edge].replace('"', "\\\""),
                target.index()
            )?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for StageGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageGraph")
            .field("stages", &self.execution_order().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Capabilities, make};
    use crate::spec::StageSpec;

    fn two_stages() -> PipelineSpec {
        PipelineSpec::new()
            .stage(
                "ps_setup",
                StageSpec::default()
                    .dir_name("PS_Setup")
                    .output("cmb_ps", "text_array", "{root}/{stage}/ps.txt")
                    .output("params", "config", "{root}/{stage}/params.yaml"),
            )
            .stage(
                "ps2map",
                StageSpec::default()
                    .input("cmb_ps", "ps_setup")
                    .input_as("settings", "ps_setup", "params")
                    .output("cmb_map", "array", "{root}/{stage}/map.cbor"),
            )
    }

    #[test]
    fn test_input_shares_producer_handler_and_template() {
        let registry = HandlerRegistry::with_builtins();
        let graph = StageGraph::resolve(&two_stages(), &registry).unwrap();

        let producer = graph.stage("ps_setup").unwrap();
        let consumer = graph.stage("ps2map").unwrap();
        let out = &producer.outputs[0];
        let input = &consumer.inputs[0];

        assert!(Arc::ptr_eq(&out.handler, &input.handler));
        assert_eq!(out.handler.name(), input.handler.name());
        assert_eq!(out.template, input.template);
        assert_eq!(input.source_dir, "PS_Setup");

        let aliased = &consumer.inputs[1];
        assert_eq!(aliased.name, "settings");
        assert_eq!(aliased.source_asset, "params");
        assert_eq!(aliased.handler_name, "config");
    }

    #[test]
    fn test_stage_binding_in_paths() {
        let registry = HandlerRegistry::with_builtins();
        let graph = StageGraph::resolve(&two_stages(), &registry).unwrap();
        let names = NameTracker::new([("root", "/r")]);

        let consumer = graph.stage("ps2map").unwrap();
        let _scope = names.scoped_set("stage", "ignored");
        assert_eq!(
            consumer.assets_in(&names)["cmb_ps"].path().unwrap(),
            "/r/PS_Setup/ps.txt"
        );
        assert_eq!(
            consumer.assets_out(&names)["cmb_map"].path().unwrap(),
            "/r/ps2map/map.cbor"
        );
    }

    #[test]
    fn test_unknown_source_stage() {
        let spec = two_stages().stage("late", StageSpec::default().input("x", "missing"));
        let err = StageGraph::resolve(&spec, &HandlerRegistry::with_builtins()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Graph(GraphError::UnknownStage { ref source_stage, .. }) if source_stage == "missing"
        ));
    }

    #[test]
    fn test_forward_reference() {
        let spec = PipelineSpec::new()
            .stage("first", StageSpec::default().input("cmb_ps", "second"))
            .stage(
                "second",
                StageSpec::default().output("cmb_ps", "text_array", "{root}/ps.txt"),
            );
        let err = StageGraph::resolve(&spec, &HandlerRegistry::with_builtins()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Graph(GraphError::ForwardReference { .. })
        ));
    }

    #[test]
    fn test_self_reference() {
        let spec = PipelineSpec::new().stage(
            "loop",
            StageSpec::default()
                .output("x", "plain_text", "{root}/x")
                .input("x", "loop"),
        );
        let err = StageGraph::resolve(&spec, &HandlerRegistry::with_builtins()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Graph(GraphError::SelfReference { .. })
        ));
    }

    #[test]
    fn test_unknown_asset() {
        let spec = two_stages().stage("third", StageSpec::default().input("nope", "ps2map"));
        let err = StageGraph::resolve(&spec, &HandlerRegistry::with_builtins()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownAsset { ref stage, ref asset } if stage == "ps2map" && asset == "nope"
        ));
    }

    #[test]
    fn test_unknown_handler() {
        let spec = PipelineSpec::new().stage(
            "a",
            StageSpec::default().output("x", "healpy_fits", "{root}/x"),
        );
        let err = StageGraph::resolve(&spec, &HandlerRegistry::with_builtins()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownHandler { ref name } if name == "healpy_fits"));
    }

    #[derive(Default)]
    struct SourceOnly;

    impl AssetHandler for SourceOnly {
        fn name(&self) -> &str {
            "source_only"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::READ_ONLY
        }
    }

    #[test]
    fn test_output_needs_writable_handler() {
        let mut registry = HandlerRegistry::with_builtins();
        registry.register("source_only", make::<SourceOnly>).unwrap();

        let spec = PipelineSpec::new().stage(
            "a",
            StageSpec::default().output("x", "source_only", "{root}/x"),
        );
        let err = StageGraph::resolve(&spec, &registry).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::HandlerCapability {
                access: Access::Write,
                ..
            }
        ));
    }

    #[test]
    fn test_order_and_display() {
        let registry = HandlerRegistry::with_builtins();
        let graph = StageGraph::resolve(&two_stages(), &registry).unwrap();

        let order: Vec<_> = graph.execution_order().collect();
        assert_eq!(order, vec!["ps_setup", "ps2map"]);
        assert_eq!(graph.upstream("ps2map"), vec!["ps_setup"]);
        assert_eq!(graph.handler_names(), vec!["array", "config", "text_array"]);

        let mermaid = graph.to_string();
        assert!(mermaid.starts_with("graph LR"));
        assert!(mermaid.contains("0 -- \"cmb_ps\" --> 1"));
        assert!(matches!(
            graph.stage("nope"),
            Err(ConfigError::UnknownStage(_))
        ));
    }
}
