//! Orchestration of a whole pipeline run.
//!
//! ```no_run
//! use stagecraft::{Environment, Executor, HandlerRegistry, PipelineContext, Settings, Stage, StageResult};
//!
//! struct Setup(Stage);
//!
//! impl Executor for Setup {
//!     fn stage(&self) -> &Stage {
//!         &self.0
//!     }
//!
//!     fn execute(&mut self) -> StageResult<()> {
//!         self.0.assets_out.get("cmb_ps")?.write(vec![1.0, 2.0])?;
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> anyhow::Result<()> {
//! let settings = Settings::from_file("pipeline.yaml")?;
//! let mut ctx = PipelineContext::new(settings, HandlerRegistry::with_builtins());
//! ctx.add_pipe(|env: &Environment| Ok(Setup(env.stage("ps_setup")?)));
//!
//! // every configuration error surfaces here, before anything runs
//! ctx.prerun_pipeline()?;
//! let report = ctx.run_pipeline()?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

use std::any::type_name;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::error::{ConfigError, GraphError, PipelineError, StageResult};
use crate::executor::{Environment, Executor};
use crate::graph::{STAGE_KEY, StageGraph};
use crate::handler::HandlerRegistry;
use crate::io::as_overhead;
use crate::namer::NameTracker;
use crate::provenance::LogMaker;
use crate::report::{RunReport, StageExecution, StageStatus};
use crate::settings::Settings;
use crate::utils::{get_style_pipeline, get_style_task};

type Factory = Box<dyn Fn(&Environment) -> StageResult<Box<dyn Executor>>>;

struct Pipe {
    factory: Factory,
    type_name: &'static str,
}

struct Constructed {
    executor: Box<dyn Executor>,
    type_name: &'static str,
}

/// Sequences the executors of one pipeline.
pub struct PipelineContext {
    settings: Settings,
    registry: HandlerRegistry,
    names: NameTracker,
    pipes: Vec<Pipe>,
    graph: Option<StageGraph>,
    executors: Vec<Constructed>,
    prepared: bool,
    report: Option<RunReport>,
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("stage panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("stage panicked: {s}")
    } else {
        String::from("stage panicked with unknown payload")
    }
}

impl PipelineContext {
    /// Creates a context whose naming context is seeded from
    /// [`Settings::context`].
    pub fn new(settings: Settings, registry: HandlerRegistry) -> Self {
        let names = NameTracker::new(settings.context.iter().map(|(k, v)| (k.clone(), v)));

        Self {
            settings,
            registry,
            names,
            pipes: Vec::new(),
            graph: None,
            executors: Vec::new(),
            prepared: false,
            report: None,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// The naming context shared by every asset of this pipeline.
    pub fn names(&self) -> &NameTracker {
        &self.names
    }

    /// The resolved graph, available after [`PipelineContext::prerun_pipeline`].
    pub fn graph(&self) -> Option<&StageGraph> {
        self.graph.as_ref()
    }

    /// Report of the last call to [`PipelineContext::run_pipeline`], kept
    /// even when that run failed.
    pub fn report(&self) -> Option<&RunReport> {
        self.report.as_ref()
    }

    /// Appends an executor factory. Nothing is constructed until
    /// [`PipelineContext::prerun_pipeline`].
    pub fn add_pipe<E, F>(&mut self, factory: F) -> &mut Self
    where
        E: Executor + 'static,
        F: Fn(&Environment) -> StageResult<E> + 'static,
    {
        self.pipes.push(Pipe {
            factory: Box::new(move |env| Ok(Box::new(factory(env)?) as Box<dyn Executor>)),
            type_name: type_name::<E>(),
        });
        self.prepared = false;
        self
    }

    /// Resolves the graph and constructs every executor in order. Any
    /// configuration problem is reported here and nothing is executed.
    pub fn prerun_pipeline(&mut self) -> Result<(), PipelineError> {
        let start = Instant::now();
        self.prepared = false;
        self.executors.clear();

        self.settings.validate()?;
        let graph = StageGraph::resolve(&self.settings.pipeline, &self.registry)?;

        let env = Environment {
            graph: &graph,
            names: &self.names,
            settings: &self.settings,
        };

        let mut executors = Vec::with_capacity(self.pipes.len());
        let mut last: Option<(usize, String)> = None;
        for pipe in &self.pipes {
            let executor = (pipe.factory)(&env)
                .map_err(|e| PipelineError::Prerun(pipe.type_name.to_string(), e))?;

            let key = executor.stage().key().to_string();
            let position = graph
                .position(&key)
                .ok_or_else(|| ConfigError::UnknownStage(key.clone()))?;

            // executors have to follow declaration order, one per stage
            if let Some((previous, after)) = last.take()
                && position <= previous
            {
                let err = if position == previous {
                    GraphError::DuplicatePipe(key)
                } else {
                    GraphError::PipeOrder { stage: key, after }
                };
                return Err(ConfigError::from(err).into());
            }

            tracing::debug!("Constructed {} for stage {}", pipe.type_name, key);
            last = Some((position, key));

            executors.push(Constructed {
                executor,
                type_name: pipe.type_name,
            });
        }

        tracing::info!(
            "Prepared {} stages {}",
            executors.len(),
            as_overhead(start)
        );

        self.graph = Some(graph);
        self.executors = executors;
        self.prepared = true;
        Ok(())
    }

    /// Executes every stage in order and stops at the first failure.
    ///
    /// Stages after a failed one are reported as skipped. Files written so far
    /// stay on disk. When provenance logging is enabled, the run log is
    /// finalized exactly once before this returns, whatever the outcome.
    pub fn run_pipeline(&mut self) -> Result<RunReport, PipelineError> {
        if !self.prepared {
            self.prerun_pipeline()?;
        }

        let Some(graph) = self.graph.as_ref() else {
            return Err(PipelineError::NotPrepared);
        };

        let run_start = Instant::now();

        let mut logger = if self.settings.logging.enabled {
            let executors: Vec<_> = self
                .executors
                .iter()
                .map(|c| (c.executor.stage().key().to_string(), c.type_name))
                .collect();
            Some(
                LogMaker::new(&self.settings, &self.names, graph, &executors)
                    .map_err(PipelineError::Provenance)?,
            )
        } else {
            None
        };

        let root_span = tracing::span!(Level::INFO, "pipeline");
        root_span.pb_set_length(self.executors.len() as u64);
        root_span.pb_set_style(&get_style_pipeline());
        root_span.pb_set_message("Running stages...");
        let _enter = root_span.enter();

        let mut records = Vec::with_capacity(self.executors.len());
        let mut failure = None;

        for constructed in &mut self.executors {
            let key = constructed.executor.stage().key().to_string();

            if failure.is_some() {
                records.push(StageExecution {
                    stage: key,
                    status: StageStatus::Skipped,
                    start: None,
                    duration: Duration::ZERO,
                });
                continue;
            }

            let span = tracing::span!(Level::INFO, "stage", name = key.as_str());
            span.pb_set_style(&get_style_task());
            span.pb_set_message(&format!("Running {key}"));
            let _enter = span.enter();

            if let Some(logger) = logger.as_mut() {
                logger.begin_stage();
            }

            tracing::info!("Running stage {key}");
            let start = Instant::now();

            let result = {
                let dir_name = constructed.executor.stage().dir_name().to_string();
                let _scope = self.names.scoped_set(STAGE_KEY, dir_name);

                // Executors only touch their own state and the shared naming
                // context, which scope guards restore during unwinding.
                match catch_unwind(AssertUnwindSafe(|| constructed.executor.execute())) {
                    Ok(result) => result,
                    Err(panic) => Err(anyhow::anyhow!(panic_message(panic))),
                }
            };

            let duration = start.elapsed();

            let status = match result {
                Ok(()) => {
                    tracing::info!("Finished stage {key} {}", as_overhead(start));
                    StageStatus::Completed
                }
                Err(err) => {
                    tracing::error!("Stage {key} failed: {err:#}");
                    failure = Some(PipelineError::Stage(key.clone(), err));
                    StageStatus::Failed
                }
            };

            if let Some(logger) = logger.as_mut()
                && let Err(err) = logger.end_stage(constructed.executor.stage())
            {
                tracing::error!("Could not write the stage log of {key}: {err:#}");
                if failure.is_none() {
                    failure = Some(PipelineError::Provenance(err));
                }
            }

            records.push(StageExecution {
                stage: key,
                status,
                start: Some(start),
                duration,
            });
            root_span.pb_inc(1);
        }

        let mut report = RunReport {
            run_id: logger.as_ref().map(|logger| logger.run_id().to_string()),
            stages: records,
            duration: run_start.elapsed(),
        };

        let finalized = logger.map(|logger| {
            let outcome = match failure {
                Some(_) => "failed",
                None => "completed",
            };
            logger.finalize(outcome)
        });

        let result = match (failure, finalized) {
            (Some(err), Some(Err(log_err))) => {
                tracing::error!("Could not finalize the provenance log: {log_err:#}");
                Err(err)
            }
            (Some(err), _) => Err(err),
            (None, Some(Err(log_err))) => Err(PipelineError::Provenance(log_err)),
            (None, _) => Ok(()),
        };

        report.duration = run_start.elapsed();
        match &result {
            Ok(()) => tracing::info!("Pipeline finished {}", as_overhead(run_start)),
            Err(_) => tracing::error!("Pipeline aborted {}", as_overhead(run_start)),
        }

        self.report = Some(report.clone());
        result.map(|()| report)
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("pipes", &self.pipes.iter().map(|p| p.type_name).collect::<Vec<_>>())
            .field("prepared", &self.prepared)
            .field("names", &self.names)
            .finish()
    }
}
