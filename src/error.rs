use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(&'static str),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),
}

/// Why an actor invocation produced no usable output.
#[derive(Debug, Error)]
pub enum ActorError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("malformed actor output: {0}")]
    Malformed(String),

    #[error("actor call timed out")]
    Timeout,

    #[error("no scripted response at position {0}")]
    ScriptExhausted(usize),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

/// Fatal configuration problems, surfaced before any trial starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid parameter schema for tool '{name}': {message}")]
    InvalidToolSchema { name: String, message: String },

    #[error("duplicate tool registration: {0}")]
    DuplicateTool(String),

    #[error("template error: {0}")]
    Template(#[from] handlebars::RenderError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task file error: {0}")]
    TaskFile(String),
}
