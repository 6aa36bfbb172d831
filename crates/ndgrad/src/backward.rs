//! Backward pass execution for reverse-mode automatic differentiation.

use crate::backend::Backend;
use crate::config::BackwardConfig;
use crate::error::AutogradError;
use crate::graph::{Graph, Value};
use crate::lazy::LazyPayload;
use crate::node::{NodeId, Predecessors};
use log::{debug, trace};
use std::collections::HashSet;

impl<B: Backend> Graph<B> {
    /// Backpropagate from `root` with the default configuration.
    ///
    /// The seed gradient is [`Backend::one`] for the context of `root`.
    ///
    /// # Errors
    ///
    /// Returns [`AutogradError::RequiresGradDisabled`] if `root` does not
    /// require a gradient and [`AutogradError::AccumulatorAlreadySet`] if the
    /// gradient of `root` is still set from an earlier pass.
    pub fn backward(&mut self, root: Value<B>) -> Result<(), AutogradError> {
        self.backward_with_config(root, &BackwardConfig::default())
    }

    /// Backpropagate from `root` with the unit seed.
    pub fn backward_with_config(
        &mut self,
        root: Value<B>,
        config: &BackwardConfig,
    ) -> Result<(), AutogradError> {
        self.check_root(root, config)?;
        let mark = self.len();
        let context = self.context(root)?.clone();
        let seed = self.insert(
            LazyPayload::ready(B::one(&context)),
            context,
            Predecessors::new(),
            false,
            config.keep_graph(),
        );
        self.run_pass(root, seed, config, mark)
    }

    /// Backpropagate from `root` with an explicit seed gradient.
    pub fn backward_with_seed(
        &mut self,
        root: Value<B>,
        seed: Value<B>,
    ) -> Result<(), AutogradError> {
        self.backward_with(root, seed, &BackwardConfig::default())
    }

    /// Backpropagate from `root` with an explicit seed and configuration.
    ///
    /// Nodes are processed in reverse topological order, so every node has
    /// received the contributions of all its consumers before its own
    /// backward function runs.
    ///
    /// Gradients of leaves add up across passes. Intermediate values start
    /// every pass from an empty accumulator, since what they hold is passed
    /// on to their operands. Without `keep_graph`, the values created while
    /// propagating are dropped once the pass is done and each accumulated
    /// gradient is kept as a plain leaf.
    pub fn backward_with(
        &mut self,
        root: Value<B>,
        seed: Value<B>,
        config: &BackwardConfig,
    ) -> Result<(), AutogradError> {
        self.check_root(root, config)?;
        self.node_id(seed)?;
        let mark = self.len();
        self.run_pass(root, seed, config, mark)
    }

    fn check_root(&self, root: Value<B>, config: &BackwardConfig) -> Result<(), AutogradError> {
        if !self.requires_grad(root)? {
            return Err(AutogradError::RequiresGradDisabled);
        }
        if !config.zero_grad() && self.grad_node(root)?.value().is_some() {
            return Err(AutogradError::AccumulatorAlreadySet);
        }
        Ok(())
    }

    fn run_pass(
        &mut self,
        root: Value<B>,
        seed: Value<B>,
        config: &BackwardConfig,
        mark: usize,
    ) -> Result<(), AutogradError> {
        self.set_create_graph(root, config.keep_graph())?;

        let order = self.topological_order(root)?;
        debug!(
            "backward from {root:?}: {} nodes, keep_graph={}, zero_grad={}",
            order.len(),
            config.keep_graph(),
            config.zero_grad()
        );

        for &id in &order {
            if config.zero_grad() || self.forward_node(id)?.has_backward_function() {
                let value = self.node_value(id)?;
                self.grad_node_mut(value)?.clear();
            }
        }

        let previous = self.set_in_backward(true);
        let result = self.run_backward(root, seed, &order, config);
        self.set_in_backward(previous);
        result?;

        if !config.keep_graph() {
            self.release_since(mark)?;
        }
        Ok(())
    }

    fn run_backward(
        &mut self,
        root: Value<B>,
        seed: Value<B>,
        order: &[NodeId],
        config: &BackwardConfig,
    ) -> Result<(), AutogradError> {
        self.set_grad(root, seed)?;
        self.force_payloads(self.node_id(root)?)?;
        for &id in order.iter().rev() {
            let node = self.forward_node(id)?;
            if !node.has_backward_function() {
                continue;
            }
            // Consumers are done, so the gradient is final; evaluating it
            // now keeps every later evaluation one level deep.
            if let Some(grad) = self.grad_node(node.owner())?.value() {
                self.force_payloads(self.node_id(grad)?)?;
            }
            trace!("backward through {id}");
            self.node_backward(id, config)?;
        }
        Ok(())
    }

    /// Nodes reachable from `root`, predecessors first.
    ///
    /// Every node appears once, after all of its predecessors; `root` is
    /// last.
    pub fn topological_order(&self, root: Value<B>) -> Result<Vec<NodeId>, AutogradError> {
        let start = self.node_id(root)?;
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(start, 0usize)];
        visited.insert(start);

        while let Some(frame) = stack.last_mut() {
            let (id, cursor) = *frame;
            match self.forward_node(id)?.prev().get(cursor) {
                Some(&child) => {
                    frame.1 += 1;
                    if visited.insert(child) {
                        stack.push((child, 0));
                    }
                }
                None => {
                    order.push(id);
                    stack.pop();
                }
            }
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::ScalarBackend;

    type G = Graph<ScalarBackend>;

    fn leaf(graph: &mut G, x: f64) -> Value<ScalarBackend> {
        let value = graph.scalar(x);
        graph.requires_grad_(value, true).unwrap()
    }

    fn grad_of(graph: &mut G, value: Value<ScalarBackend>) -> f64 {
        let grad = graph.grad(value).unwrap().unwrap();
        graph.data(grad).unwrap()
    }

    #[test]
    fn test_backward_requires_grad() {
        let mut graph = G::new();
        let x = graph.scalar(1.0);
        let y = graph.mul_scalar(x, 2.0).unwrap();

        assert_eq!(graph.backward(y), Err(AutogradError::RequiresGradDisabled));
        let seed = graph.scalar(1.0);
        assert_eq!(
            graph.backward_with_seed(y, seed),
            Err(AutogradError::RequiresGradDisabled)
        );
    }

    #[test]
    fn test_topological_order_single_leaf() {
        let mut graph = G::new();
        let x = leaf(&mut graph, 1.0);
        let order = graph.topological_order(x).unwrap();
        assert_eq!(order, vec![graph.node_id(x).unwrap()]);
    }

    #[test]
    fn test_topological_order_visits_shared_node_once() {
        let mut graph = G::new();
        let x = leaf(&mut graph, 2.0);
        let a = graph.add_scalar(x, 1.0).unwrap();
        let b = graph.mul_scalar(x, 3.0).unwrap();
        let c = graph.mul(a, b).unwrap();

        let order = graph.topological_order(c).unwrap();
        let ids: Vec<_> = [x, a, b, c]
            .iter()
            .map(|&v| graph.node_id(v).unwrap())
            .collect();

        assert_eq!(order.len(), 4);
        assert_eq!(order[0], ids[0]);
        assert_eq!(order[3], ids[3]);
        assert!(order.contains(&ids[1]));
        assert!(order.contains(&ids[2]));
    }

    #[test]
    fn test_diamond_accumulates_all_consumers() {
        let mut graph = G::new();
        let x = leaf(&mut graph, 2.0);
        let a = graph.add_scalar(x, 1.0).unwrap();
        let b = graph.mul_scalar(x, 3.0).unwrap();
        let c = graph.mul(a, b).unwrap();

        graph.backward(c).unwrap();

        // dc/dx = 3 * (x + 1) + 3x
        assert_eq!(grad_of(&mut graph, x), 15.0);
        assert_eq!(grad_of(&mut graph, a), 6.0);
        assert_eq!(grad_of(&mut graph, b), 3.0);
    }

    #[test]
    fn test_explicit_seed_scales_gradient() {
        let mut graph = G::new();
        let x = leaf(&mut graph, 4.0);
        let y = graph.mul(x, x).unwrap();
        let seed = graph.scalar(0.5);

        graph.backward_with_seed(y, seed).unwrap();
        assert_eq!(grad_of(&mut graph, x), 4.0);
        assert_eq!(graph.grad(y).unwrap(), Some(seed));
    }

    #[test]
    fn test_second_pass_without_zero_grad_rejects_seed() {
        let mut graph = G::new();
        let x = leaf(&mut graph, 1.0);
        let y = graph.mul_scalar(x, 2.0).unwrap();

        graph.backward(y).unwrap();
        assert_eq!(graph.backward(y), Err(AutogradError::AccumulatorAlreadySet));
    }

    #[test]
    fn test_zero_grad_resets_visited_accumulators() {
        let mut graph = G::new();
        let x = leaf(&mut graph, 1.0);
        let y = graph.mul_scalar(x, 2.0).unwrap();

        graph.backward(y).unwrap();
        let handle = graph.grad(x).unwrap().unwrap();
        assert_eq!(graph.data(handle).unwrap(), 2.0);

        let config = BackwardConfig::new().with_zero_grad(true);
        graph.backward_with_config(y, &config).unwrap();

        assert_eq!(grad_of(&mut graph, x), 2.0);
        assert_eq!(graph.grad(x).unwrap(), Some(handle));
    }

    #[test]
    fn test_gradients_accumulate_across_passes() {
        let mut graph = G::new();
        let x = leaf(&mut graph, 3.0);
        let y = graph.mul_scalar(x, 2.0).unwrap();
        let z = graph.mul_scalar(x, 5.0).unwrap();

        graph.backward(y).unwrap();
        graph.backward(z).unwrap();
        assert_eq!(grad_of(&mut graph, x), 7.0);
    }

    #[test]
    fn test_intermediate_gradient_not_carried_into_next_pass() {
        let mut graph = G::new();
        let x = leaf(&mut graph, 1.0);
        let h = graph.mul(x, x).unwrap();
        let y = graph.mul_scalar(h, 3.0).unwrap();
        let z = graph.mul_scalar(h, 5.0).unwrap();

        graph.backward(y).unwrap();
        assert_eq!(grad_of(&mut graph, x), 6.0);
        assert_eq!(grad_of(&mut graph, h), 3.0);

        graph.backward(z).unwrap();
        // 2x * 3 + 2x * 5
        assert_eq!(grad_of(&mut graph, x), 16.0);
        assert_eq!(grad_of(&mut graph, h), 5.0);
    }

    #[test]
    fn test_identical_passes_keep_graph_size() {
        let mut graph = G::new();
        let x = leaf(&mut graph, 3.0);
        let y = graph.mul(x, x).unwrap();
        let config = BackwardConfig::new().with_zero_grad(true);

        let sizes: Vec<usize> = (0..5)
            .map(|_| {
                graph.backward_with_config(y, &config).unwrap();
                graph.len()
            })
            .collect();

        assert!(sizes.iter().all(|&size| size == sizes[0]), "{sizes:?}");
        assert_eq!(grad_of(&mut graph, x), 6.0);
        assert_eq!(graph.data(y).unwrap(), 9.0);
    }

    #[test]
    fn test_accumulating_passes_keep_graph_size() {
        let mut graph = G::new();
        let x = leaf(&mut graph, 2.0);
        let y = graph.mul_scalar(x, 4.0).unwrap();
        let handle = {
            let seed = graph.scalar(1.0);
            graph.backward_with_seed(y, seed).unwrap();
            graph.grad(x).unwrap().unwrap()
        };
        let size = graph.len();

        for pass in 2..6 {
            let z = graph.mul_scalar(x, 1.0).unwrap();
            graph.backward(z).unwrap();
            assert_eq!(graph.grad(x).unwrap(), Some(handle));
            assert_eq!(graph.data(handle).unwrap(), 4.0 + (pass - 1) as f64);
            // only the new root and its own gradient remain
            assert_eq!(graph.len(), size + 2 * (pass - 1));
        }
    }

    #[test]
    fn test_kept_graph_is_not_released() {
        let mut graph = G::new();
        let x = leaf(&mut graph, 2.0);
        let y = graph.mul(x, x).unwrap();
        let before = graph.len();

        graph
            .backward_with_config(y, &BackwardConfig::new().with_keep_graph(true))
            .unwrap();
        let dx = graph.grad(x).unwrap().unwrap();
        assert!(graph.len() > before + 2);
        assert!(!graph.node(dx).unwrap().is_leaf());
    }

    #[test]
    fn test_backward_sets_create_graph_on_root() {
        let mut graph = G::new();
        let x = leaf(&mut graph, 1.0);
        let y = graph.mul(x, x).unwrap();

        graph
            .backward_with_config(y, &BackwardConfig::new().with_keep_graph(true))
            .unwrap();
        assert!(graph.create_graph(y).unwrap());
    }

    #[test]
    fn test_set_grad_unsealed_only_during_pass() {
        let mut graph = G::new();
        let x = leaf(&mut graph, 1.0);
        let y = graph.mul_scalar(x, 2.0).unwrap();
        graph.backward(y).unwrap();

        let g = graph.scalar(1.0);
        assert_eq!(graph.set_grad(x, g), Err(AutogradError::AccumulatorSealed));
    }
}
