pub mod actors;
pub mod cache;
pub mod domains;
pub mod env;
pub mod error;
pub mod evaluator;
pub mod messages;
pub mod orchestrator;
pub mod providers;
pub mod runner;
pub mod tasks;

pub use actors::{
    termination_signal,
    Actor,
    EnvView,
    LlmActor,
    SamplingParams,
    ScriptedActor,
    Signal,
};
pub use cache::{seed_from_transcript, Fingerprint, InMemoryCache, ResponseCache};
pub use env::{
    diff,
    json_schema_for,
    Domain,
    DomainError,
    EnvironmentState,
    StateChange,
    StateDelta,
    ToolDef,
    ToolRegistry,
};
pub use error::{ActorError, CacheError, ConfigError, ProviderError};
pub use evaluator::{Evaluator, RewardInfo, RewardWeights};
pub use messages::{
    validate,
    Conversation,
    Message,
    ProtocolConfig,
    ProtocolViolation,
    Sender,
    TokenUsage,
    ToolCall,
    ToolOutcome,
};
pub use orchestrator::{
    Orchestrator,
    OrchestratorConfig,
    TerminationReason,
    ToolTurnPolicy,
    TrialResult,
    UsageTotals,
};
pub use providers::LLMProvider;
pub use runner::{read_results, write_results, TrialRunner};
pub use tasks::{load_tasks, ExpectedAction, FirstSpeaker, GroundTruth, Task};
