//! Declarative workflows: a DAG of node invocations plus the data-flow
//! connections between them.
pub mod definition;
pub mod executor;
pub mod graph;
pub mod parser;

use std::path::PathBuf;

use thiserror::Error;

pub use definition::{NodeConnection, WorkflowDefinition, WorkflowNode};
pub use executor::{
    AttemptRecord, ErrorStrategy, ExecutionStatus, NodeFailure, NodeInvoker, NodeOutcome, RegistryInvoker,
    TransformEvaluator, TransformRegistry, WorkflowExecutor, WorkflowReport,
};
pub use graph::WorkflowGraph;
pub use parser::{WorkflowFormat, WorkflowParser};

pub const CYCLE_MESSAGE: &str = "Workflow contains cyclic dependencies";

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("could not read workflow {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed workflow: {0}")]
    Parse(String),
    #[error("could not serialize workflow: {0}")]
    Serialize(String),
    #[error("invalid workflow: {}", .0.join("; "))]
    Invalid(Vec<String>),
    #[error("Workflow contains cyclic dependencies")]
    Cycle,
    #[error("workflow input rejected: {}", .0.join("; "))]
    InvalidInput(Vec<String>),
    #[error("input schema is not a usable JSON schema: {0}")]
    Schema(String),
}
