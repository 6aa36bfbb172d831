//! Arena holding every value of a computation and its graph nodes.
//!
//! A [`Graph`] owns one slot per value. Each slot carries the payload, the
//! context, the gradient flags, one [`ForwardNode`] and one [`GradNode`].
//! Values are addressed through [`Value`] handles which map to slots through
//! an indirection table, so two handles can trade places with
//! [`Graph::swap_with`] while callers keep holding them.

use crate::adapter::NodeAdapter;
use crate::backend::Backend;
use crate::config::BackwardConfig;
use crate::error::AutogradError;
use crate::lazy::{LazyPayload, Producer};
use crate::node::{BackwardFn, ForwardNode, GradNode, NativeGradFn, NodeId, Predecessors};
use crate::registry::{Registry, Resource};
use log::debug;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_GRAPH_ID: AtomicU32 = AtomicU32::new(0);

/// Handle to a value in a [`Graph`].
///
/// Handles are plain indices: copying one never copies the payload. A handle
/// keeps its identity for the lifetime of the graph even when the state
/// behind it is exchanged by [`Graph::swap_with`].
pub struct Value<B> {
    graph: u32,
    index: usize,
    _backend: PhantomData<fn() -> B>,
}

impl<B> Value<B> {
    fn new(graph: u32, index: usize) -> Self {
        Self {
            graph,
            index,
            _backend: PhantomData,
        }
    }

    /// Position of the handle in its graph's handle table.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<B> Clone for Value<B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for Value<B> {}

impl<B> PartialEq for Value<B> {
    fn eq(&self, other: &Self) -> bool {
        self.graph == other.graph && self.index == other.index
    }
}

impl<B> Eq for Value<B> {}

impl<B> Hash for Value<B> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.graph.hash(state);
        self.index.hash(state);
    }
}

impl<B> Debug for Value<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value(g{}#{})", self.graph, self.index)
    }
}

/// Payload state shared with the registry.
pub(crate) struct ValueCell<D> {
    payload: RefCell<LazyPayload<D>>,
    name: RefCell<Option<String>>,
    closed: Cell<bool>,
    registered: Cell<bool>,
}

impl<D: Clone + 'static> ValueCell<D> {
    fn new(payload: LazyPayload<D>) -> Self {
        Self {
            payload: RefCell::new(payload),
            name: RefCell::new(None),
            closed: Cell::new(false),
            registered: Cell::new(false),
        }
    }

    fn payload(&self) -> Result<LazyPayload<D>, AutogradError> {
        if self.closed.get() {
            return Err(AutogradError::PayloadClosed);
        }
        Ok(self.holder())
    }

    /// Current holder, whether or not the value was closed.
    fn holder(&self) -> LazyPayload<D> {
        self.payload.borrow().clone()
    }
}

impl<D: Clone + 'static> Resource for ValueCell<D> {
    fn is_closed(&self) -> bool {
        self.closed.get()
    }

    fn close(&self) {
        if !self.closed.replace(true) {
            self.payload.borrow().clear_cache();
        }
    }

    fn describe(&self) -> String {
        self.name
            .borrow()
            .clone()
            .unwrap_or_else(|| "<unnamed>".to_string())
    }
}

struct Slot<B: Backend> {
    cell: Rc<ValueCell<B::Data>>,
    context: B::Context,
    requires_grad: bool,
    create_graph: bool,
    cached_grad: Option<Value<B>>,
    node: ForwardNode<B>,
    grad: GradNode<B>,
}

/// Arena of values and graph nodes for one backend.
///
/// # Example
///
/// ```
/// use ndgrad::{Graph, ScalarBackend};
///
/// let mut graph: Graph<ScalarBackend> = Graph::new();
/// let x = graph.scalar(3.0);
/// graph.requires_grad_(x, true).unwrap();
/// let y = graph.mul(x, x).unwrap();
///
/// graph.backward(y).unwrap();
/// let dx = graph.grad(x).unwrap().unwrap();
/// assert_eq!(graph.data(dx).unwrap(), 6.0);
/// ```
pub struct Graph<B: Backend> {
    id: u32,
    slots: Vec<Slot<B>>,
    handles: Vec<NodeId>,
    registry: Option<Rc<Registry>>,
    in_backward: bool,
}

impl<B: Backend> Graph<B> {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            slots: Vec::new(),
            handles: Vec::new(),
            registry: None,
            in_backward: false,
        }
    }

    /// Create an empty graph that registers every value in `registry`.
    pub fn with_registry(registry: Rc<Registry>) -> Self {
        let mut graph = Self::new();
        graph.attach_registry(registry);
        graph
    }

    /// Attach a registry. Values created from now on are registered in it.
    pub fn attach_registry(&mut self, registry: Rc<Registry>) {
        self.registry = Some(registry);
    }

    /// The attached registry, if any.
    pub fn registry(&self) -> Option<&Rc<Registry>> {
        self.registry.as_ref()
    }

    /// Number of values in the graph.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the graph holds no values.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Create a leaf value from a payload producer.
    ///
    /// # Errors
    ///
    /// Returns [`AutogradError::MissingProducer`] if `producer` is `None`.
    pub fn create(
        &mut self,
        producer: Option<Producer<B::Data>>,
        context: B::Context,
    ) -> Result<Value<B>, AutogradError> {
        let producer = producer.ok_or(AutogradError::MissingProducer)?;
        Ok(self.insert(
            LazyPayload::new(producer),
            context,
            Predecessors::new(),
            false,
            false,
        ))
    }

    /// Create a leaf value from an already computed payload.
    pub fn leaf(&mut self, data: B::Data, context: B::Context) -> Value<B> {
        self.insert(
            LazyPayload::ready(data),
            context,
            Predecessors::new(),
            false,
            false,
        )
    }

    /// Fresh leaf sharing the payload holder of `value`, without history.
    pub fn detach(&mut self, value: Value<B>) -> Result<Value<B>, AutogradError> {
        let slot = self.slot(value)?;
        let payload = slot.cell.payload()?;
        let context = slot.context.clone();
        Ok(self.insert(payload, context, Predecessors::new(), false, false))
    }

    pub(crate) fn insert(
        &mut self,
        payload: LazyPayload<B::Data>,
        context: B::Context,
        prev: Predecessors,
        requires_grad: bool,
        create_graph: bool,
    ) -> Value<B> {
        let node = NodeId(self.slots.len());
        let handle = Value::new(self.id, self.handles.len());
        let cell = Rc::new(ValueCell::new(payload));
        if let Some(registry) = &self.registry {
            cell.registered.set(true);
            registry.register(Rc::clone(&cell) as Rc<dyn Resource>);
        }
        self.handles.push(node);
        self.slots.push(Slot {
            cell,
            context,
            requires_grad,
            create_graph,
            cached_grad: None,
            node: ForwardNode::new(handle, prev),
            grad: GradNode::new(),
        });
        handle
    }

    /// Evaluate the payload of `value`.
    ///
    /// Unevaluated predecessors are computed first, leaves before the values
    /// that consume them, so the depth of the graph does not matter.
    pub fn data(&self, value: Value<B>) -> Result<B::Data, AutogradError> {
        let payload = self.payload(value)?;
        if !payload.is_cached() {
            self.force_payloads(self.handle(value)?)?;
        }
        payload.get()
    }

    /// Evaluate every uncached payload reachable from `root`, predecessors
    /// first. Cached payloads are not descended into.
    pub(crate) fn force_payloads(&self, root: NodeId) -> Result<(), AutogradError> {
        let mut seen = HashSet::new();
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            let slot = self.slots.get(id.0).ok_or(AutogradError::UnknownNode(id))?;
            let payload = slot.cell.holder();
            if expanded {
                payload.get()?;
            } else if !payload.is_cached() && seen.insert(id) {
                stack.push((id, true));
                stack.extend(slot.node.prev().iter().map(|&prev| (prev, false)));
            }
        }
        Ok(())
    }

    /// The lazy payload holder of `value`.
    pub fn payload(&self, value: Value<B>) -> Result<LazyPayload<B::Data>, AutogradError> {
        self.slot(value)?.cell.payload()
    }

    /// Replace the payload producer of `value`.
    ///
    /// A fresh holder is installed, so any memoized result is dropped.
    /// Values derived from `value` captured the previous holder when they
    /// were built and keep computing from it, even if they were never
    /// evaluated.
    pub fn data_(
        &mut self,
        value: Value<B>,
        producer: Producer<B::Data>,
    ) -> Result<Value<B>, AutogradError> {
        let slot = self.slot(value)?;
        if slot.cell.closed.get() {
            return Err(AutogradError::PayloadClosed);
        }
        *slot.cell.payload.borrow_mut() = LazyPayload::new(producer);
        Ok(value)
    }

    /// Context of `value`.
    pub fn context(&self, value: Value<B>) -> Result<&B::Context, AutogradError> {
        Ok(&self.slot(value)?.context)
    }

    /// Whether gradients are accumulated for `value`.
    pub fn requires_grad(&self, value: Value<B>) -> Result<bool, AutogradError> {
        Ok(self.slot(value)?.requires_grad)
    }

    /// Mark `value` as requiring a gradient.
    pub fn requires_grad_(
        &mut self,
        value: Value<B>,
        requires_grad: bool,
    ) -> Result<Value<B>, AutogradError> {
        self.slot_mut(value)?.requires_grad = requires_grad;
        Ok(value)
    }

    /// Retention flag of the last backward pass rooted at `value`.
    pub fn create_graph(&self, value: Value<B>) -> Result<bool, AutogradError> {
        Ok(self.slot(value)?.create_graph)
    }

    pub(crate) fn set_create_graph(
        &mut self,
        value: Value<B>,
        create_graph: bool,
    ) -> Result<(), AutogradError> {
        self.slot_mut(value)?.create_graph = create_graph;
        Ok(())
    }

    /// Whether contributions to `value` are accumulated at all.
    pub(crate) fn accepts_gradient(&self, value: Value<B>) -> Result<bool, AutogradError> {
        let slot = self.slot(value)?;
        Ok(slot.requires_grad || slot.create_graph)
    }

    /// Name of `value`.
    pub fn name(&self, value: Value<B>) -> Result<Option<String>, AutogradError> {
        Ok(self.slot(value)?.cell.name.borrow().clone())
    }

    /// Name `value`. The name also labels it in registry reports.
    pub fn name_(
        &mut self,
        value: Value<B>,
        name: impl Into<String>,
    ) -> Result<Value<B>, AutogradError> {
        *self.slot(value)?.cell.name.borrow_mut() = Some(name.into());
        Ok(value)
    }

    /// Current gradient of `value`, or `None` if nothing was accumulated.
    ///
    /// The first call after a pass remembers the returned handle. When a
    /// later pass replaces the accumulated value, the remembered handle is
    /// swapped with the new one and returned again, so every handle obtained
    /// from earlier calls observes the latest gradient.
    pub fn grad(&mut self, value: Value<B>) -> Result<Option<Value<B>>, AutogradError> {
        let slot = self.slot(value)?;
        let Some(current) = slot.grad.value() else {
            return Ok(None);
        };
        let cached = slot.cached_grad;
        match cached {
            Some(cached) if cached != current => {
                self.swap_with(cached, current)?;
                self.slot_mut(value)?.grad.redirect(cached);
                Ok(Some(cached))
            }
            _ => {
                self.slot_mut(value)?.cached_grad = Some(current);
                Ok(Some(current))
            }
        }
    }

    /// Assign the gradient of `value` directly.
    ///
    /// # Errors
    ///
    /// Returns [`AutogradError::AccumulatorSealed`] outside of a backward
    /// pass and [`AutogradError::AccumulatorAlreadySet`] if the accumulator
    /// already holds a value.
    pub fn set_grad(&mut self, value: Value<B>, grad: Value<B>) -> Result<(), AutogradError> {
        if !self.in_backward {
            return Err(AutogradError::AccumulatorSealed);
        }
        self.slot_index(grad)?;
        self.slot_mut(value)?.grad.set_value(grad)
    }

    /// Gradient accumulator of `value`.
    pub fn grad_node(&self, value: Value<B>) -> Result<&GradNode<B>, AutogradError> {
        Ok(&self.slot(value)?.grad)
    }

    pub(crate) fn grad_node_mut(
        &mut self,
        value: Value<B>,
    ) -> Result<&mut GradNode<B>, AutogradError> {
        Ok(&mut self.slot_mut(value)?.grad)
    }

    /// Install a native gradient source on the accumulator of `value`.
    pub fn set_native_gradient(
        &mut self,
        value: Value<B>,
        source: Option<NativeGradFn<B>>,
    ) -> Result<(), AutogradError> {
        self.grad_node_mut(value)?.set_native_gradient(source);
        Ok(())
    }

    /// Ignore (or stop ignoring) the native gradient of `value`.
    pub fn set_disable_native_gradient(
        &mut self,
        value: Value<B>,
        disable: bool,
    ) -> Result<(), AutogradError> {
        self.grad_node_mut(value)?.set_disable_native_gradient(disable);
        Ok(())
    }

    /// Exchange the state behind two handles.
    ///
    /// After the call `a` resolves to what `b` resolved to and vice versa:
    /// payload, context, flags, forward node and accumulator move together.
    ///
    /// # Errors
    ///
    /// Returns [`AutogradError::ForeignValue`] if `a` belongs to another
    /// graph and [`AutogradError::UnsupportedSwap`] if `b` does.
    pub fn swap_with(&mut self, a: Value<B>, b: Value<B>) -> Result<(), AutogradError> {
        let node_a = self.handle(a)?;
        let node_b = self
            .handle(b)
            .map_err(|_| AutogradError::UnsupportedSwap)?;
        if node_a == node_b {
            return Ok(());
        }
        self.handles.swap(a.index(), b.index());
        self.slots[node_b.0].node.set_owner(a);
        self.slots[node_a.0].node.set_owner(b);
        Ok(())
    }

    /// Forward node of `value`.
    pub fn node(&self, value: Value<B>) -> Result<&ForwardNode<B>, AutogradError> {
        Ok(&self.slot(value)?.node)
    }

    /// Node id currently behind `value`.
    pub fn node_id(&self, value: Value<B>) -> Result<NodeId, AutogradError> {
        self.handle(value)
    }

    /// Forward node by id.
    pub fn forward_node(&self, id: NodeId) -> Result<&ForwardNode<B>, AutogradError> {
        self.slots
            .get(id.0)
            .map(|slot| &slot.node)
            .ok_or(AutogradError::UnknownNode(id))
    }

    /// Handle currently owning node `id`.
    pub fn node_value(&self, id: NodeId) -> Result<Value<B>, AutogradError> {
        Ok(self.forward_node(id)?.owner())
    }

    /// Assign the backward function of node `id`.
    pub fn set_backward_function(
        &mut self,
        id: NodeId,
        backward: BackwardFn<B>,
    ) -> Result<(), AutogradError> {
        self.slots
            .get_mut(id.0)
            .ok_or(AutogradError::UnknownNode(id))?
            .node
            .set_backward_function(id, backward)
    }

    /// Run the backward function of node `id`. Leaves are a no-op.
    pub fn node_backward(
        &mut self,
        id: NodeId,
        config: &BackwardConfig,
    ) -> Result<(), AutogradError> {
        let node = self.forward_node(id)?;
        let owner = node.owner();
        match node.backward_function() {
            Some(backward) => backward(self, owner, config),
            None => Ok(()),
        }
    }

    /// View the node of `value` through another value representation.
    pub fn adapt_node<W: 'static>(
        &self,
        value: Value<B>,
        map: impl Fn(Value<B>) -> W + 'static,
        unmap: impl Fn(&W) -> Value<B> + 'static,
    ) -> Result<NodeAdapter<B, W>, AutogradError> {
        Ok(NodeAdapter::new(
            self.node_id(value)?,
            Rc::new(map),
            Rc::new(unmap),
        ))
    }

    /// Register `value` in the attached registry.
    ///
    /// Values created while a registry is attached are already registered;
    /// registering them again has no effect.
    ///
    /// # Errors
    ///
    /// Returns [`AutogradError::RegistryNotAttached`] without a registry.
    pub fn register(&self, value: Value<B>) -> Result<(), AutogradError> {
        let registry = self
            .registry
            .as_ref()
            .ok_or(AutogradError::RegistryNotAttached)?;
        let cell = &self.slot(value)?.cell;
        if !cell.registered.replace(true) {
            registry.register(Rc::clone(cell) as Rc<dyn Resource>);
        }
        Ok(())
    }

    /// Release the payload of `value`. Later reads fail.
    pub fn close(&self, value: Value<B>) -> Result<(), AutogradError> {
        self.slot(value)?.cell.close();
        Ok(())
    }

    /// Whether `value` was closed.
    pub fn is_closed(&self, value: Value<B>) -> Result<bool, AutogradError> {
        Ok(self.slot(value)?.cell.is_closed())
    }

    pub(crate) fn set_in_backward(&mut self, in_backward: bool) -> bool {
        std::mem::replace(&mut self.in_backward, in_backward)
    }

    /// Drop every value created since the graph held `mark` values.
    ///
    /// Gradients that ended up on one of those values are evaluated first
    /// and kept as leaves. A gradient handle remembered by [`Graph::grad`]
    /// is reused when it is an open leaf; otherwise a new leaf is created.
    /// Nothing is released if a handle created after `mark` was swapped
    /// with an older one.
    pub(crate) fn release_since(&mut self, mark: usize) -> Result<(), AutogradError> {
        if self.handles[mark..].iter().any(|id| id.0 < mark) {
            debug!(
                "keeping {} pass values: handles were swapped",
                self.slots.len() - mark
            );
            return Ok(());
        }

        let mut kept = Vec::new();
        for index in 0..mark {
            let Some(grad) = self.slots[index].grad.value() else {
                continue;
            };
            if grad.index() >= mark {
                kept.push((index, self.data(grad)?, self.context(grad)?.clone()));
            }
        }

        if let Some(registry) = &self.registry {
            let released: HashSet<*const ()> = self.slots[mark..]
                .iter()
                .map(|slot| Rc::as_ptr(&slot.cell) as *const ())
                .collect();
            registry.forget(&released);
        }
        let released = self.slots.len() - mark;
        // newest first, so no payload chain is dropped recursively
        while self.slots.len() > mark {
            self.slots.pop();
        }
        self.handles.truncate(mark);

        let mut reused = HashSet::new();
        let count = kept.len();
        for (index, data, context) in kept {
            let cached = self.slots[index].cached_grad;
            let target = match cached {
                Some(cached) if self.is_open_leaf(cached)? && reused.insert(cached) => {
                    let slot = self.slot_mut(cached)?;
                    *slot.cell.payload.borrow_mut() = LazyPayload::ready(data);
                    slot.context = context;
                    cached
                }
                _ => self.leaf(data, context),
            };
            let slot = &mut self.slots[index];
            slot.grad.redirect(target);
            slot.cached_grad.get_or_insert(target);
        }
        debug!("released {released} pass values, kept {count} gradients");
        Ok(())
    }

    fn is_open_leaf(&self, value: Value<B>) -> Result<bool, AutogradError> {
        let slot = self.slot(value)?;
        Ok(slot.node.is_leaf() && !slot.node.has_backward_function() && !slot.cell.is_closed())
    }

    fn handle(&self, value: Value<B>) -> Result<NodeId, AutogradError> {
        if value.graph != self.id {
            return Err(AutogradError::ForeignValue);
        }
        self.handles
            .get(value.index())
            .copied()
            .ok_or(AutogradError::UnknownNode(NodeId(value.index())))
    }

    pub(crate) fn slot_index(&self, value: Value<B>) -> Result<usize, AutogradError> {
        self.handle(value).map(|id| id.0)
    }

    fn slot(&self, value: Value<B>) -> Result<&Slot<B>, AutogradError> {
        let index = self.slot_index(value)?;
        Ok(&self.slots[index])
    }

    fn slot_mut(&mut self, value: Value<B>) -> Result<&mut Slot<B>, AutogradError> {
        let index = self.slot_index(value)?;
        Ok(&mut self.slots[index])
    }
}

impl<B: Backend> Default for Graph<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Drop for Graph<B> {
    fn drop(&mut self) {
        // Payloads capture the holders of older values; dropping the newest
        // slot first keeps every release one level deep.
        while self.slots.pop().is_some() {}
    }
}

impl<B: Backend> Debug for Graph<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("values", &self.slots.len())
            .field("registry", &self.registry.as_ref().map(|r| r.name().to_string()))
            .field("in_backward", &self.in_backward)
            .finish()
    }
}
