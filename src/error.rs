use camino::Utf8PathBuf;
use thiserror::Error;

/// Result of stage-level logic, such as executor construction or execution.
pub type StageResult<T> = anyhow::Result<T, anyhow::Error>;

/// Errors raised while resolving the pipeline declaration, before any stage
/// runs. None of these are ever retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid stage graph: {0}")]
    Graph(#[from] GraphError),

    #[error("Unknown handler '{name}'")]
    UnknownHandler { name: String },

    #[error("Handler '{name}' is already registered with a different constructor")]
    DuplicateHandler { name: String },

    #[error("Stage '{stage}' does not declare an output asset named '{asset}'")]
    UnknownAsset { stage: String, asset: String },

    #[error("Stage '{0}' is not declared in the pipeline")]
    UnknownStage(String),

    #[error("Missing context key '{key}' while rendering '{template}'")]
    MissingContextKey { key: String, template: String },

    #[error("Initial naming context is missing the required key '{0}'")]
    MissingInitialKey(String),

    #[error("Malformed template '{template}': {reason}")]
    Template { template: String, reason: String },

    #[error("Asset '{asset}' of stage '{stage}' needs handler '{handler}' to {access}, which it cannot")]
    HandlerCapability {
        stage: String,
        asset: String,
        handler: String,
        access: Access,
    },

    #[error("Couldn't parse settings.\n{0}")]
    Settings(#[from] serde_yaml::Error),
}

/// Structural problems in the declared stage graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("stage '{stage}' reads '{asset}' from undeclared stage '{source_stage}'")]
    UnknownStage {
        stage: String,
        asset: String,
        source_stage: String,
    },

    #[error("stage '{stage}' reads '{asset}' from stage '{source_stage}', which is declared later")]
    ForwardReference {
        stage: String,
        asset: String,
        source_stage: String,
    },

    #[error("stage '{stage}' reads its own output '{asset}'")]
    SelfReference { stage: String, asset: String },

    #[error("cycle detected through stage '{0}'")]
    Cycle(String),

    #[error("executor for stage '{stage}' is added after the one for '{after}', which is declared later")]
    PipeOrder { stage: String, after: String },

    #[error("stage '{0}' has more than one executor")]
    DuplicatePipe(String),
}

/// Kind of access attempted on an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Write => write!(f, "write"),
        }
    }
}

fn direction_message(access: &Access) -> &'static str {
    match access {
        Access::Read => "cannot read an output asset",
        Access::Write => "cannot write an input asset",
    }
}

/// Errors raised by assets and their handlers.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("Asset '{asset}': {}", direction_message(.access))]
    Direction { asset: String, access: Access },

    #[error("File not found: {0}")]
    NotFound(Utf8PathBuf),

    #[error("Couldn't access file {path}.\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed content in {path}: {reason}")]
    Deserialize { path: Utf8PathBuf, reason: String },

    #[error("Couldn't serialize data for {path}: {reason}")]
    Serialize { path: Utf8PathBuf, reason: String },

    #[error("Handler '{handler}' does not support {access}")]
    Unsupported { handler: String, access: Access },

    #[error("Expected {expected} payload, got {found}")]
    PayloadKind {
        expected: &'static str,
        found: &'static str,
    },

    #[error(transparent)]
    Path(#[from] ConfigError),
}

impl AssetError {
    pub(crate) fn deserialize(path: impl Into<Utf8PathBuf>, reason: impl ToString) -> Self {
        AssetError::Deserialize {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn serialize(path: impl Into<Utf8PathBuf>, reason: impl ToString) -> Self {
        AssetError::Serialize {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors surfaced by [`crate::PipelineContext`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Error while resolving the pipeline.\n{0}")]
    Config(#[from] ConfigError),

    #[error("Executor '{0}' failed to initialize:\n{1}")]
    Prerun(String, anyhow::Error),

    #[error("Stage '{0}' failed:\n{1}")]
    Stage(String, anyhow::Error),

    #[error("Error while writing provenance logs:\n{0}")]
    Provenance(anyhow::Error),

    #[error("The pipeline has not been prepared")]
    NotPrepared,
}

impl PipelineError {
    /// Finds a [`ConfigError`] anywhere in this error, including inside stage
    /// errors raised by executor constructors.
    pub fn config(&self) -> Option<&ConfigError> {
        match self {
            PipelineError::Config(err) => Some(err),
            PipelineError::Prerun(_, err) | PipelineError::Stage(_, err) => err
                .downcast_ref::<ConfigError>()
                .or_else(|| match err.downcast_ref::<AssetError>() {
                    Some(AssetError::Path(err)) => Some(err),
                    _ => None,
                }),
            _ => None,
        }
    }
}
