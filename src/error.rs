//! Error types shared by the graph passes and the lowering engine.

use thiserror::Error;

/// Failure raised by a single operator strategy while emitting compute or
/// applying its schedule.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("expected {expected} inputs, got {actual}")]
    Arity { expected: usize, actual: usize },

    #[error("missing attribute `{0}`")]
    MissingAttr(String),

    #[error("invalid attribute `{name}`: {detail}")]
    InvalidAttr { name: String, detail: String },

    #[error("shape error: {0}")]
    Shape(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("{0}")]
    Other(String),
}

/// Failure of a loop-level schedule primitive.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("no schedule block named `{0}`")]
    BlockNotFound(String),

    #[error("no loop named `{0}`")]
    LoopNotFound(String),

    #[error("split factor must be positive, got {0}")]
    InvalidFactor(usize),

    #[error("loops {0:?} are not perfectly nested")]
    NotPerfectlyNested(Vec<String>),

    #[error("block `{0}` cannot be inlined: {1}")]
    NotInlinable(String, String),

    #[error("expected a single merged expression, found {0}")]
    NotMerged(usize),
}

/// Top-level error of the fusion passes and the lowering engine.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("graph contains a cycle through node `{0}`")]
    Cycle(String),

    #[error("no shape recorded for tensor `{0}`")]
    MissingShape(String),

    #[error("no dtype recorded for tensor `{0}`")]
    MissingDtype(String),

    #[error("tensor `{0}` has no producer and is not a graph input")]
    UnknownTensor(String),

    #[error("operator `{0}` is not registered")]
    UnknownOperator(String),

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("fusion group {0} is not connected to its nodes")]
    DisconnectedGroup(usize),

    #[error("fusion groups do not partition the graph: {0}")]
    GroupCoverage(String),

    #[error("unsupported {stage}: {detail}")]
    Unsupported { stage: &'static str, detail: String },

    #[error("unknown reduce type: {count} stage tensors (with last dim: {with_last_dim})")]
    UnsupportedStageCount { count: usize, with_last_dim: bool },

    #[error("strategy for node `{node}` failed: {source}")]
    Strategy {
        node: String,
        #[source]
        source: StrategyError,
    },

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

pub type Result<T> = std::result::Result<T, CompileError>;
