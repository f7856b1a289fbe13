//! Stages and the executors implementing their logic.
//!
//! A [`Stage`] is the runtime view of one resolved stage: its assets bound to
//! the run's [`NameTracker`], its iteration keys and its extra flags. An
//! [`Executor`] owns a `Stage` and implements [`Executor::execute`].
//!
//! Executors are built by factories registered with
//! [`crate::PipelineContext::add_pipe`]. Factories receive an
//! [`Environment`] and obtain their stage from it, so the assets of a stage
//! always come from the resolved graph and never from the executor itself.

use std::sync::Arc;

use rayon::prelude::*;
use serde::de::DeserializeOwned;

use crate::asset::{AnyAsset, AssetSet, Input, Output};
use crate::error::{ConfigError, StageResult};
use crate::graph::{StageDescriptor, StageGraph};
use crate::namer::{NameTracker, ScopeGuard};
use crate::settings::Settings;

/// Context key holding the current split name while iterating.
pub const SPLIT_KEY: &str = "split";
/// Context key holding the current simulation index while iterating.
pub const SIM_KEY: &str = "sim";

/// The logic of one pipeline stage.
pub trait Executor {
    /// The stage this executor was constructed for.
    fn stage(&self) -> &Stage;

    /// Runs the stage. Reads and writes go through the stage's assets.
    fn execute(&mut self) -> StageResult<()>;
}

/// One point of a stage's iteration space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterKey {
    pub split: Option<String>,
    pub sim: Option<usize>,
}

impl IterKey {
    fn entries(&self) -> Vec<(&'static str, String)> {
        let mut entries = Vec::with_capacity(2);
        if let Some(split) = &self.split {
            entries.push((SPLIT_KEY, split.clone()));
        }
        if let Some(sim) = self.sim {
            entries.push((SIM_KEY, sim.to_string()));
        }
        entries
    }

    /// Enters this key's scope on `names`.
    pub fn enter(&self, names: &NameTracker) -> ScopeGuard {
        names.scoped_set_many(self.entries())
    }
}

impl std::fmt::Display for IterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.split, self.sim) {
            (Some(split), Some(sim)) => write!(f, "{split}/{sim}"),
            (Some(split), None) => f.write_str(split),
            (None, Some(sim)) => write!(f, "{sim}"),
            (None, None) => f.write_str("-"),
        }
    }
}

/// Runtime view of a resolved stage.
pub struct Stage {
    descriptor: Arc<StageDescriptor>,
    names: NameTracker,
    pub assets_in: AssetSet<Input>,
    pub assets_out: AssetSet<Output>,
    n_workers: usize,
}

impl Stage {
    pub(crate) fn new(descriptor: Arc<StageDescriptor>, names: &NameTracker, n_workers: usize) -> Self {
        Self {
            assets_in: descriptor.assets_in(names),
            assets_out: descriptor.assets_out(names),
            names: names.clone(),
            descriptor,
            n_workers,
        }
    }

    pub fn key(&self) -> &str {
        &self.descriptor.key
    }

    /// Directory name substituted for `{stage}` in this stage's outputs.
    pub fn dir_name(&self) -> &str {
        &self.descriptor.dir_name
    }

    pub fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    pub fn names(&self) -> &NameTracker {
        &self.names
    }

    /// Configured worker count for [`Stage::par_iterate`].
    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    pub fn makes_stage_log(&self) -> bool {
        self.descriptor.make_stage_log
    }

    /// Deserializes an extra key of the stage declaration.
    pub fn flag<T: DeserializeOwned>(&self, key: &str) -> StageResult<Option<T>> {
        match self.descriptor.flags.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Every asset of the stage, inputs first.
    pub fn assets(&self) -> Vec<AnyAsset<'_>> {
        self.assets_in
            .iter()
            .map(AnyAsset::from)
            .chain(self.assets_out.iter().map(AnyAsset::from))
            .collect()
    }

    /// The iteration space: every split crossed with its simulation indices.
    /// A stage without splits iterates exactly once, with no scope entries.
    pub fn iter_keys(&self) -> Vec<IterKey> {
        if self.descriptor.splits.is_empty() {
            return vec![IterKey {
                split: None,
                sim: None,
            }];
        }

        let mut keys = Vec::new();
        for split in &self.descriptor.splits {
            match split.n_sims() {
                Some(n_sims) => keys.extend((0..n_sims).map(|sim| IterKey {
                    split: Some(split.name().to_string()),
                    sim: Some(sim),
                })),
                None => keys.push(IterKey {
                    split: Some(split.name().to_string()),
                    sim: None,
                }),
            }
        }
        keys
    }

    /// Runs `f` once per iteration key, in order, with `split` and `sim` set
    /// in the naming context. Stops at the first error.
    pub fn iterate<F>(&self, mut f: F) -> StageResult<()>
    where
        F: FnMut(&Stage, &IterKey) -> StageResult<()>,
    {
        for key in self.iter_keys() {
            let _scope = key.enter(&self.names);
            tracing::debug!(stage = self.key(), %key, "iteration");
            f(self, &key)?;
        }
        Ok(())
    }

    /// Like [`Stage::iterate`], but distributes the keys over `workers`
    /// threads. Every key runs on a [`Stage::fork`], so workers never share a
    /// naming context. Keys complete in no particular order.
    pub fn par_iterate<F>(&self, workers: usize, f: F) -> StageResult<()>
    where
        F: Fn(&Stage, &IterKey) -> StageResult<()> + Sync,
    {
        if workers <= 1 {
            return self.iterate(f);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("stage-worker-{i}"))
            .build()?;

        let keys = self.iter_keys();
        pool.install(|| {
            keys.par_iter().try_for_each(|key| {
                let stage = self.fork();
                let _scope = key.enter(&stage.names);
                tracing::debug!(stage = stage.key(), %key, "iteration");
                f(&stage, key)
            })
        })
    }

    /// A copy of this stage observing an independent naming context seeded
    /// with the current one.
    pub fn fork(&self) -> Stage {
        let names = self.names.fork();
        Stage {
            descriptor: self.descriptor.clone(),
            assets_in: self.assets_in.rebind(&names),
            assets_out: self.assets_out.rebind(&names),
            names,
            n_workers: self.n_workers,
        }
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("key", &self.descriptor.key)
            .field("dir_name", &self.descriptor.dir_name)
            .field("assets_in", &self.assets_in.len())
            .field("assets_out", &self.assets_out.len())
            .finish()
    }
}

/// What an executor factory gets to see while the pipeline is prepared.
pub struct Environment<'a> {
    pub(crate) graph: &'a StageGraph,
    pub(crate) names: &'a NameTracker,
    pub(crate) settings: &'a Settings,
}

impl<'a> Environment<'a> {
    /// Builds the runtime view of the stage declared under `key`. No file is
    /// touched.
    pub fn stage(&self, key: &str) -> Result<Stage, ConfigError> {
        let descriptor = self.graph.stage(key)?;
        Ok(Stage::new(
            Arc::new(descriptor.clone()),
            self.names,
            self.settings.n_workers,
        ))
    }

    pub fn names(&self) -> &'a NameTracker {
        self.names
    }

    pub fn settings(&self) -> &'a Settings {
        self.settings
    }

    pub fn graph(&self) -> &'a StageGraph {
        self.graph
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::handler::HandlerRegistry;
    use crate::spec::{PipelineSpec, SplitSpec, StageSpec};

    fn settings(root: &str) -> Settings {
        let mut spec = StageSpec::default()
            .output("map", "plain_text", "{root}/{stage}/{split}/sim{sim:04}.txt")
            .split("Test", Some(3))
            .split("Train", Some(2));
        spec.flags.insert("nside".into(), serde_json::json!(16));
        spec.splits.push(SplitSpec::Name("Full".into()));

        Settings::new(PipelineSpec::new().stage("maps", spec)).with_context("root", root)
    }

    fn stage_for(settings: &Settings, names: &NameTracker) -> Stage {
        let graph = StageGraph::resolve(&settings.pipeline, &HandlerRegistry::with_builtins()).unwrap();
        let env = Environment {
            graph: &graph,
            names,
            settings,
        };
        env.stage("maps").unwrap()
    }

    #[test]
    fn test_iter_keys() {
        let settings = settings("/r");
        let names = NameTracker::new([("root", "/r")]);
        let stage = stage_for(&settings, &names);

        let keys: Vec<_> = stage.iter_keys().iter().map(ToString::to_string).collect();
        assert_eq!(
            keys,
            vec!["Test/0", "Test/1", "Test/2", "Train/0", "Train/1", "Full"]
        );
        assert_eq!(stage.flag::<u32>("nside").unwrap(), Some(16));
        assert_eq!(stage.flag::<u32>("lmax").unwrap(), None);
    }

    #[test]
    fn test_iterate_scopes_and_restores() {
        let settings = settings("/r");
        let names = NameTracker::new([("root", "/r")]);
        let stage = stage_for(&settings, &names);

        let mut paths = Vec::new();
        stage
            .iterate(|stage, key| {
                if key.sim.is_some() {
                    paths.push(stage.assets_out["map"].path()?.to_string());
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(paths.len(), 5);
        assert_eq!(paths[0], "/r/maps/Test/sim0000.txt");
        assert_eq!(paths[4], "/r/maps/Train/sim0001.txt");
        assert!(!names.contains("split"));
        assert!(!names.contains("sim"));
    }

    #[test]
    fn test_iterate_stops_on_error() {
        let settings = settings("/r");
        let names = NameTracker::new([("root", "/r")]);
        let stage = stage_for(&settings, &names);

        let mut seen = 0;
        let err = stage
            .iterate(|_, key| {
                seen += 1;
                match key.sim {
                    Some(1) => anyhow::bail!("bad sim"),
                    _ => Ok(()),
                }
            })
            .unwrap_err();

        assert_eq!(err.to_string(), "bad sim");
        assert_eq!(seen, 2);
        assert!(!names.contains("split"));
    }

    #[test]
    fn test_par_iterate_writes_every_key() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap().to_string();
        let settings = settings(&root);
        let names = NameTracker::new([("root", root.as_str())]);
        let stage = stage_for(&settings, &names);

        let seen = Mutex::new(Vec::new());
        stage
            .par_iterate(4, |stage, key| {
                assert!(!stage.names().same_context(&names));
                if key.sim.is_some() {
                    stage.assets_out["map"].write(key.to_string())?;
                }
                seen.lock().unwrap().push(key.to_string());
                Ok(())
            })
            .unwrap();

        assert_eq!(seen.into_inner().unwrap().len(), 6);
        assert!(dir.path().join("maps/Train/sim0001.txt").exists());
        assert!(dir.path().join("maps/Test/sim0002.txt").exists());
        assert!(!names.contains("split"));
    }

    #[test]
    fn test_par_iterate_propagates_failure() {
        let settings = settings("/r");
        let names = NameTracker::new([("root", "/r")]);
        let stage = stage_for(&settings, &names);

        let result = stage.par_iterate(2, |_, key| match key.split.as_deref() {
            Some("Train") => anyhow::bail!("train failed"),
            _ => Ok(()),
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_stage() {
        let settings = settings("/r");
        let names = NameTracker::default();
        let graph = StageGraph::resolve(&settings.pipeline, &HandlerRegistry::with_builtins()).unwrap();
        let env = Environment {
            graph: &graph,
            names: &names,
            settings: &settings,
        };
        assert!(matches!(
            env.stage("nope"),
            Err(ConfigError::UnknownStage(key)) if key == "nope"
        ));
    }
}
