//! Capability interface supplied by a payload type.

use crate::error::AutogradError;
use crate::graph::{Graph, Value};
use std::fmt::Debug;

/// Arithmetic primitives the engine needs from a payload type.
///
/// The engine itself only ever adds gradients and creates the two identity
/// elements. Everything else (multiplication, negation, comparisons) is
/// supplied per operator by the closures passed to
/// [`Graph::apply_binary`] and [`Graph::apply_unary`].
pub trait Backend: Sized + 'static {
    /// Payload type.
    type Data: Clone + Debug + 'static;

    /// Shape or size descriptor propagated alongside payloads.
    type Context: Clone + Debug + 'static;

    /// Elementwise addition, used to fold gradient contributions.
    fn add(lhs: &Self::Data, rhs: &Self::Data) -> Self::Data;

    /// Additive identity matching `ctx`.
    fn zero(ctx: &Self::Context) -> Self::Data;

    /// Multiplicative identity matching `ctx`, the default backward seed.
    fn one(ctx: &Self::Context) -> Self::Data;

    /// Hook applied to every gradient contribution before it is accumulated.
    ///
    /// `native` is the gradient reported by the target's native gradient
    /// source, if the source is installed and not disabled. The default keeps
    /// the generic contribution.
    fn adapt_gradient(
        graph: &mut Graph<Self>,
        target: Value<Self>,
        computed: Value<Self>,
        native: Option<Value<Self>>,
    ) -> Result<Value<Self>, AutogradError> {
        let _ = (graph, target, native);
        Ok(computed)
    }
}
