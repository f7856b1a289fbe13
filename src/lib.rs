#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod asset;
mod error;
mod executor;
mod graph;
pub mod handler;
mod io;
mod namer;
mod pipeline;
mod provenance;
mod report;
mod settings;
mod spec;
mod utils;

pub use crate::asset::{AnyAsset, Asset, AssetSet, Direction, Input, Output};
pub use crate::error::*;
pub use crate::executor::{Environment, Executor, IterKey, SIM_KEY, SPLIT_KEY, Stage};
pub use crate::graph::{InputDecl, OutputDecl, STAGE_KEY, StageDescriptor, StageGraph};
pub use crate::handler::{AssetHandler, Capabilities, HandlerFactory, HandlerRegistry, Payload};
pub use crate::namer::{NameTracker, ScopeGuard};
pub use crate::pipeline::PipelineContext;
pub use crate::provenance::{LogCapture, LogMaker};
pub use crate::report::{RunReport, StageExecution, StageStatus};
pub use crate::settings::{LoggingSettings, REQUIRED_CONTEXT, Scalar, Settings};
pub use crate::spec::{InputSpec, OrderedMap, OutputSpec, PipelineSpec, SplitSpec, StageSpec};
pub use crate::utils::init_logging;
