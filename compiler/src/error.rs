// error.rs — Error taxonomy shared by every graph operation
//
// Construction, transformation, compilation and archiving all report failures
// through `GraphError`. Every failure aborts the operation in progress; nothing
// in the crate retries.

use thiserror::Error;

use crate::id::{NodeId, PortRef};
use crate::layout::DimensionOrder;

/// Errors produced while building, rewriting, evaluating or compiling a model.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    /// Malformed layout, type or size mismatch, or a dangling/forward port
    /// reference. Nothing is committed to the model when this is raised.
    #[error("construction error: {0}")]
    Construction(String),

    /// `transform_port_elements` found no remap entry for an old output.
    #[error("unmapped reference: output {port} has no entry in the remap table")]
    UnmappedReference { port: PortRef },

    /// An output was mapped twice, never mapped, or mapped to elements of the
    /// wrong size or type during a transformer pass.
    #[error("output mapping violation for {port}: {reason}")]
    MappingContract { port: PortRef, reason: String },

    /// Repeated refinement hit the iteration cap while still decomposing nodes.
    #[error("refinement did not converge after {iterations} iterations")]
    RefinementNonConvergence { iterations: usize },

    /// Compute on a non-Computable node, Compile on a non-Compilable one.
    #[error("{operation} is not supported by {node_type}")]
    UnsupportedOperation {
        node_type: String,
        operation: &'static str,
    },

    /// A stored archive version is rejected by the node kind.
    #[error("cannot read {node_type} archive version {found} (current version is {current})")]
    ArchiveVersion {
        node_type: String,
        found: u32,
        current: u32,
    },

    /// A consumer rejects the logical dimension order of its producer and no
    /// adapter node sits between them.
    #[error("layout mismatch at {node} input '{input}': expects order {expected}, producer has {found}")]
    LayoutMismatch {
        node: NodeId,
        input: String,
        expected: DimensionOrder,
        found: DimensionOrder,
    },

    /// Malformed or missing archived field.
    #[error("archive error: {0}")]
    Archive(String),

    /// Compute precondition: a port read by a node has no value yet.
    #[error("no value available for {port}")]
    MissingValue { port: PortRef },

    /// The call contract of a map or compiled map was violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The reference interpreter hit a malformed kernel.
    #[error("execution error: {0}")]
    Execution(String),
}

impl GraphError {
    pub(crate) fn unsupported(node_type: impl Into<String>, operation: &'static str) -> Self {
        GraphError::UnsupportedOperation {
            node_type: node_type.into(),
            operation,
        }
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(e: serde_json::Error) -> Self {
        GraphError::Archive(e.to_string())
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, GraphError>;
