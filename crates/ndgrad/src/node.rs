//! Forward graph nodes and gradient accumulator nodes.

use crate::backend::Backend;
use crate::config::BackwardConfig;
use crate::error::AutogradError;
use crate::graph::{Graph, Value};
use smallvec::SmallVec;
use std::fmt::{self, Debug};
use std::rc::Rc;

/// Index of a node in a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Get the internal index.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node({})", self.0)
    }
}

/// Predecessor list of a node.
pub type Predecessors = SmallVec<[NodeId; 2]>;

/// Backward function attached to a forward node.
///
/// Invoked with the value currently owning the node and the active
/// configuration. It reads the owner's accumulated gradient and folds
/// contributions into the operands' accumulators.
pub type BackwardFn<B> =
    Rc<dyn Fn(&mut Graph<B>, Value<B>, &BackwardConfig) -> Result<(), AutogradError>>;

/// Source of a gradient computed natively by the backend.
pub type NativeGradFn<B> = Rc<dyn Fn() -> Option<Value<B>>>;

/// Node of the forward graph.
///
/// Records the operands that produced a value and how to propagate a
/// gradient back to them. Created once per value; only the backward
/// function is assigned afterwards, at most once.
pub struct ForwardNode<B: Backend> {
    owner: Value<B>,
    prev: Predecessors,
    backward: Option<BackwardFn<B>>,
}

impl<B: Backend> ForwardNode<B> {
    pub(crate) fn new(owner: Value<B>, prev: Predecessors) -> Self {
        Self {
            owner,
            prev,
            backward: None,
        }
    }

    /// The value currently represented by this node.
    pub fn owner(&self) -> Value<B> {
        self.owner
    }

    pub(crate) fn set_owner(&mut self, owner: Value<B>) {
        self.owner = owner;
    }

    /// Operand nodes, in operand order.
    pub fn prev(&self) -> &[NodeId] {
        &self.prev
    }

    /// Whether this node has no predecessors.
    pub fn is_leaf(&self) -> bool {
        self.prev.is_empty()
    }

    /// Whether a backward function was assigned.
    pub fn has_backward_function(&self) -> bool {
        self.backward.is_some()
    }

    /// The backward function, if one was assigned.
    pub fn backward_function(&self) -> Option<BackwardFn<B>> {
        self.backward.clone()
    }

    /// Assign the backward function.
    ///
    /// `id` is only used for the error report.
    pub(crate) fn set_backward_function(
        &mut self,
        id: NodeId,
        backward: BackwardFn<B>,
    ) -> Result<(), AutogradError> {
        if self.backward.is_some() {
            return Err(AutogradError::BackwardAlreadyAssigned(id));
        }
        self.backward = Some(backward);
        Ok(())
    }
}

impl<B: Backend> Debug for ForwardNode<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardNode")
            .field("owner", &self.owner)
            .field("prev", &self.prev)
            .field("has_backward", &self.backward.is_some())
            .finish()
    }
}

/// Accumulator for the gradient of one value.
///
/// Starts unset. It is assigned once per backward pass, then every further
/// contribution is folded in with the caller-supplied addition.
///
/// The accumulator itself never joins the forward graph: it only points at
/// the value holding the gradient, and it has no backward function. Its edge
/// list is materialized empty by the first assignment, so the structural
/// conflict reported by [`GradNode::add_`] cannot be triggered through
/// [`Graph`] operations and only guards against an accumulator that was
/// given edges.
pub struct GradNode<B: Backend> {
    value: Option<Value<B>>,
    prev: Option<Predecessors>,
    native: Option<NativeGradFn<B>>,
    disable_native_gradient: bool,
}

impl<B: Backend> GradNode<B> {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self {
            value: None,
            prev: None,
            native: None,
            disable_native_gradient: false,
        }
    }

    /// The accumulated gradient, if any.
    pub fn value(&self) -> Option<Value<B>> {
        self.value
    }

    /// Graph edges attached to the accumulator. Empty until materialized.
    pub fn prev(&self) -> &[NodeId] {
        self.prev.as_deref().unwrap_or(&[])
    }

    /// Assign the first value.
    ///
    /// # Errors
    ///
    /// Returns [`AutogradError::AccumulatorAlreadySet`] if a value is held.
    pub fn set_value(&mut self, value: Value<B>) -> Result<(), AutogradError> {
        if self.value.is_some() {
            return Err(AutogradError::AccumulatorAlreadySet);
        }
        self.prev.get_or_insert_with(Predecessors::new);
        self.value = Some(value);
        Ok(())
    }

    /// Fold a contribution into the accumulator.
    ///
    /// An empty accumulator stores `value` directly; otherwise `add` combines
    /// the current value with `value`.
    ///
    /// # Errors
    ///
    /// Returns [`AutogradError::StructuralConflict`] when a second
    /// contribution arrives while the accumulator carries graph edges, and
    /// propagates errors from `add`. Accumulators never carry a backward
    /// function, so edges are the only conflicting state.
    pub fn add_<F>(&mut self, value: Value<B>, add: F) -> Result<(), AutogradError>
    where
        F: FnOnce(Value<B>, Value<B>) -> Result<Value<B>, AutogradError>,
    {
        let edges = self.prev.get_or_insert_with(Predecessors::new);
        match self.value {
            None => {
                self.value = Some(value);
                Ok(())
            }
            Some(_) if !edges.is_empty() => Err(AutogradError::StructuralConflict),
            Some(current) => {
                self.value = Some(add(current, value)?);
                Ok(())
            }
        }
    }

    /// Gradient computed natively by the backend, if a source is installed.
    pub fn native_grad(&self) -> Option<Value<B>> {
        self.native.as_ref().and_then(|source| source())
    }

    /// Install the native gradient source.
    pub fn set_native_gradient(&mut self, source: Option<NativeGradFn<B>>) {
        self.native = source;
    }

    /// Whether the native gradient is ignored.
    pub fn is_native_gradient_disabled(&self) -> bool {
        self.disable_native_gradient
    }

    /// Toggle the native gradient preference.
    pub fn set_disable_native_gradient(&mut self, disable: bool) {
        self.disable_native_gradient = disable;
    }

    /// Native gradient honoring the disable flag.
    pub(crate) fn preferred_native_grad(&self) -> Option<Value<B>> {
        if self.disable_native_gradient {
            None
        } else {
            self.native_grad()
        }
    }

    pub(crate) fn clear(&mut self) {
        self.value = None;
    }

    /// Point the accumulator at another handle without the set-once check.
    pub(crate) fn redirect(&mut self, value: Value<B>) {
        self.value = Some(value);
    }
}

impl<B: Backend> Default for GradNode<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Debug for GradNode<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GradNode")
            .field("value", &self.value)
            .field("prev", &self.prev)
            .field("has_native", &self.native.is_some())
            .field("disable_native_gradient", &self.disable_native_gradient)
            .finish()
    }
}
