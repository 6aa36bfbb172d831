//! Operator application and gradient accumulation.
//!
//! Every differentiable operation is built on [`Graph::apply_binary`] or
//! [`Graph::apply_unary`]. Both evaluate lazily, wire the result into the
//! forward graph and attach a backward function that folds the chain-rule
//! contributions into the operands' accumulators.

use crate::backend::Backend;
use crate::config::BackwardConfig;
use crate::error::AutogradError;
use crate::graph::{Graph, Value};
use crate::lazy::LazyPayload;
use crate::node::{BackwardFn, NodeId};
use log::trace;
use smallvec::smallvec;
use std::rc::Rc;

impl<B: Backend> Graph<B> {
    /// Apply a binary operator.
    ///
    /// The result's payload is `forward(lhs, rhs)`, its context is
    /// `context(lhs, rhs)` and its predecessors are `[lhs, rhs]`. During a
    /// backward pass `back_lhs(grad, (lhs, rhs))` is accumulated into `lhs`,
    /// and `back_rhs(grad, (lhs, rhs))` into `rhs` when `rhs` requires a
    /// gradient.
    ///
    /// The backward closures receive the live operands when the pass keeps
    /// the graph and detached snapshots otherwise.
    pub fn apply_binary<F, BL, BR, M>(
        &mut self,
        lhs: Value<B>,
        rhs: Value<B>,
        forward: F,
        back_lhs: BL,
        back_rhs: BR,
        context: M,
    ) -> Result<Value<B>, AutogradError>
    where
        F: Fn(&B::Data, &B::Data) -> B::Data + 'static,
        BL: Fn(&mut Graph<B>, Value<B>, (Value<B>, Value<B>)) -> Result<Value<B>, AutogradError>
            + 'static,
        BR: Fn(&mut Graph<B>, Value<B>, (Value<B>, Value<B>)) -> Result<Value<B>, AutogradError>
            + 'static,
        M: FnOnce(&B::Context, &B::Context) -> B::Context,
    {
        let lhs_id = self.node_id(lhs)?;
        let rhs_id = self.node_id(rhs)?;
        let lhs_payload = self.payload(lhs)?;
        let rhs_payload = self.payload(rhs)?;
        let out_context = context(self.context(lhs)?, self.context(rhs)?);
        let requires_grad = self.requires_grad(lhs)? || self.requires_grad(rhs)?;

        let payload = LazyPayload::from_fn(move || {
            let a = lhs_payload.get()?;
            let b = rhs_payload.get()?;
            Ok(forward(&a, &b))
        });
        let out = self.insert(
            payload,
            out_context,
            smallvec![lhs_id, rhs_id],
            requires_grad,
            false,
        );

        let backward: BackwardFn<B> =
            Rc::new(move |graph: &mut Graph<B>, owner: Value<B>, config: &BackwardConfig| {
                let Some(grad) = graph.incoming_grad(owner, config)? else {
                    return Ok(());
                };
                let operands = (
                    graph.operand(lhs_id, config)?,
                    graph.operand(rhs_id, config)?,
                );

                let lhs = graph.node_value(lhs_id)?;
                if graph.accepts_gradient(lhs)? {
                    let contribution = back_lhs(graph, grad, operands)?;
                    graph.accumulate_contribution(lhs, contribution)?;
                }
                let rhs = graph.node_value(rhs_id)?;
                if graph.requires_grad(rhs)? {
                    let contribution = back_rhs(graph, grad, operands)?;
                    graph.accumulate_contribution(rhs, contribution)?;
                }
                Ok(())
            });
        let out_id = self.node_id(out)?;
        self.set_backward_function(out_id, backward)?;
        Ok(out)
    }

    /// Apply a unary operator.
    ///
    /// The result inherits `requires_grad` and `create_graph` from `input`.
    /// `back(grad, input)` is accumulated into `input` during a backward pass.
    pub fn apply_unary<F, BK, M>(
        &mut self,
        input: Value<B>,
        forward: F,
        back: BK,
        context: M,
    ) -> Result<Value<B>, AutogradError>
    where
        F: Fn(&B::Data) -> B::Data + 'static,
        BK: Fn(&mut Graph<B>, Value<B>, Value<B>) -> Result<Value<B>, AutogradError> + 'static,
        M: FnOnce(&B::Context) -> B::Context,
    {
        let input_id = self.node_id(input)?;
        let input_payload = self.payload(input)?;
        let out_context = context(self.context(input)?);
        let requires_grad = self.requires_grad(input)?;
        let create_graph = self.create_graph(input)?;

        let payload = LazyPayload::from_fn(move || Ok(forward(&input_payload.get()?)));
        let out = self.insert(
            payload,
            out_context,
            smallvec![input_id],
            requires_grad,
            create_graph,
        );

        let backward: BackwardFn<B> =
            Rc::new(move |graph: &mut Graph<B>, owner: Value<B>, config: &BackwardConfig| {
                let Some(grad) = graph.incoming_grad(owner, config)? else {
                    return Ok(());
                };
                let target = graph.node_value(input_id)?;
                if graph.accepts_gradient(target)? {
                    let operand = graph.operand(input_id, config)?;
                    let contribution = back(graph, grad, operand)?;
                    graph.accumulate_contribution(target, contribution)?;
                }
                Ok(())
            });
        let out_id = self.node_id(out)?;
        self.set_backward_function(out_id, backward)?;
        Ok(out)
    }

    /// Differentiable addition using [`Backend::add`].
    ///
    /// The context of the result is the context of `lhs`.
    pub fn add(&mut self, lhs: Value<B>, rhs: Value<B>) -> Result<Value<B>, AutogradError> {
        self.apply_binary(
            lhs,
            rhs,
            B::add,
            |_, grad, _| Ok(grad),
            |_, grad, _| Ok(grad),
            |context, _| context.clone(),
        )
    }

    /// Fold `contribution` into the gradient of `target`.
    ///
    /// Does nothing unless `target` requires a gradient or retains its graph.
    /// An empty accumulator is first initialized with [`Backend::zero`].
    pub fn add_to_grad(
        &mut self,
        target: Value<B>,
        contribution: Value<B>,
    ) -> Result<(), AutogradError> {
        if !self.accepts_gradient(target)? {
            return Ok(());
        }
        if self.grad_node(target)?.value().is_none() {
            let context = self.context(target)?.clone();
            let zero = self.leaf(B::zero(&context), context);
            self.grad_node_mut(target)?.set_value(zero)?;
        }

        trace!("accumulating {contribution:?} into gradient of {target:?}");
        let mut accumulator = std::mem::take(self.grad_node_mut(target)?);
        let result = accumulator.add_(contribution, |current, value| self.add(current, value));
        *self.grad_node_mut(target)? = accumulator;
        result
    }

    /// Gradient flowing into `owner`, detached unless the graph is kept.
    fn incoming_grad(
        &mut self,
        owner: Value<B>,
        config: &BackwardConfig,
    ) -> Result<Option<Value<B>>, AutogradError> {
        let grad = self.grad_node(owner)?.value();
        match grad {
            Some(grad) if !config.keep_graph() => self.detach(grad).map(Some),
            grad => Ok(grad),
        }
    }

    /// Operand as seen by a backward closure.
    fn operand(&mut self, id: NodeId, config: &BackwardConfig) -> Result<Value<B>, AutogradError> {
        let value = self.node_value(id)?;
        if config.keep_graph() {
            Ok(value)
        } else {
            self.detach(value)
        }
    }

    fn accumulate_contribution(
        &mut self,
        target: Value<B>,
        contribution: Value<B>,
    ) -> Result<(), AutogradError> {
        let native = self.grad_node(target)?.preferred_native_grad();
        let contribution = B::adapt_gradient(self, target, contribution, native)?;
        self.add_to_grad(target, contribution)
    }
}
