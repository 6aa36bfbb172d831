//! View a forward node through a different value representation.
//!
//! Subsystems that wrap values in their own type (a backend with its own
//! gradient tracking, for instance) can work on the graph through a
//! [`NodeAdapter`]. The adapter holds no graph state: every call goes to the
//! underlying node, converting values with the supplied mapping functions.

use crate::backend::Backend;
use crate::config::BackwardConfig;
use crate::error::AutogradError;
use crate::graph::{Graph, Value};
use crate::node::NodeId;
use std::fmt::{self, Debug};
use std::rc::Rc;

/// Backward function expressed over the adapted representation.
pub type AdaptedBackwardFn<B, W> =
    Rc<dyn Fn(&mut Graph<B>, W, &BackwardConfig) -> Result<(), AutogradError>>;

/// Node of a [`Graph`] seen through the mappings `Value<B> -> W` and
/// `&W -> Value<B>`.
pub struct NodeAdapter<B: Backend, W> {
    node: NodeId,
    map: Rc<dyn Fn(Value<B>) -> W>,
    unmap: Rc<dyn Fn(&W) -> Value<B>>,
}

impl<B: Backend, W: 'static> NodeAdapter<B, W> {
    pub(crate) fn new(
        node: NodeId,
        map: Rc<dyn Fn(Value<B>) -> W>,
        unmap: Rc<dyn Fn(&W) -> Value<B>>,
    ) -> Self {
        Self { node, map, unmap }
    }

    /// Id of the underlying node.
    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// Mapped value currently owning the node.
    pub fn value(&self, graph: &Graph<B>) -> Result<W, AutogradError> {
        Ok((self.map)(graph.node_value(self.node)?))
    }

    /// Predecessors, adapted with the same mappings.
    pub fn prev(&self, graph: &Graph<B>) -> Result<Vec<NodeAdapter<B, W>>, AutogradError> {
        Ok(graph
            .forward_node(self.node)?
            .prev()
            .iter()
            .map(|&node| Self {
                node,
                map: Rc::clone(&self.map),
                unmap: Rc::clone(&self.unmap),
            })
            .collect())
    }

    /// Assign the backward function of the underlying node.
    ///
    /// The function receives the mapped owner.
    pub fn set_backward_function(
        &self,
        graph: &mut Graph<B>,
        backward: impl Fn(&mut Graph<B>, W, &BackwardConfig) -> Result<(), AutogradError> + 'static,
    ) -> Result<(), AutogradError> {
        let map = Rc::clone(&self.map);
        graph.set_backward_function(
            self.node,
            Rc::new(
                move |graph: &mut Graph<B>, owner: Value<B>, config: &BackwardConfig| {
                    backward(graph, map(owner), config)
                },
            ),
        )
    }

    /// Backward function of the underlying node over the adapted
    /// representation.
    pub fn backward_function(
        &self,
        graph: &Graph<B>,
    ) -> Result<Option<AdaptedBackwardFn<B, W>>, AutogradError> {
        let Some(backward) = graph.forward_node(self.node)?.backward_function() else {
            return Ok(None);
        };
        let unmap = Rc::clone(&self.unmap);
        let adapted: AdaptedBackwardFn<B, W> = Rc::new(
            move |graph: &mut Graph<B>, owner: W, config: &BackwardConfig| {
                backward(graph, unmap(&owner), config)
            },
        );
        Ok(Some(adapted))
    }

    /// Run the backward function of the underlying node.
    pub fn backward(
        &self,
        graph: &mut Graph<B>,
        config: &BackwardConfig,
    ) -> Result<(), AutogradError> {
        graph.node_backward(self.node, config)
    }
}

impl<B: Backend, W> Clone for NodeAdapter<B, W> {
    fn clone(&self) -> Self {
        Self {
            node: self.node,
            map: Rc::clone(&self.map),
            unmap: Rc::clone(&self.unmap),
        }
    }
}

impl<B: Backend, W> Debug for NodeAdapter<B, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeAdapter")
            .field("node", &self.node)
            .finish()
    }
}
