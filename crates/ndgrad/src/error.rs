//! Error types for ndgrad.

use crate::node::NodeId;
use thiserror::Error;

/// Errors raised while building or differentiating a computation graph.
///
/// Every variant signals a programming error in graph construction; none of
/// them are retried or recovered internally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AutogradError {
    /// A value was created without a payload producer.
    #[error("payload producer must be supplied when creating a value")]
    MissingProducer,

    /// `backward` was invoked on a value that does not require a gradient.
    #[error("cannot backpropagate through a value without requires_grad=true")]
    RequiresGradDisabled,

    /// The gradient accumulator already holds a value.
    #[error("gradient accumulator already holds a value")]
    AccumulatorAlreadySet,

    /// Direct assignment to an accumulator outside of a backward pass.
    #[error("gradient accumulator can only be assigned during a backward pass")]
    AccumulatorSealed,

    /// A second contribution reached an accumulator that carries graph edges.
    #[error("gradient accumulator carries graph edges and cannot fold another contribution")]
    StructuralConflict,

    /// The node already has a backward function.
    #[error("backward function already assigned to {0}")]
    BackwardAlreadyAssigned(NodeId),

    /// `register` was called on a graph without a registry.
    #[error("no registry attached to this graph")]
    RegistryNotAttached,

    /// A registry was cleared while some of its values were still open.
    #[error("registry `{registry}` still holds {open} unclosed values")]
    UnclosedValues { registry: String, open: usize },

    /// `swap_with` target is not a value of this graph.
    #[error("swap not supported for this value")]
    UnsupportedSwap,

    /// The value handle was created by a different graph.
    #[error("value belongs to a different graph")]
    ForeignValue,

    /// Node index out of range.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// The payload of the value was closed.
    #[error("payload has been closed")]
    PayloadClosed,
}
