//! Reference `f64` backend.
//!
//! Scalars have no shape, so the context is `()`. The arithmetic below is
//! built entirely on [`Graph::apply_binary`] and [`Graph::apply_unary`];
//! each backward closure is itself differentiable, which is what makes
//! higher-order gradients work when the graph is kept.

use crate::backend::Backend;
use crate::error::AutogradError;
use crate::graph::{Graph, Value};

/// Scalar `f64` backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScalarBackend;

impl Backend for ScalarBackend {
    type Data = f64;
    type Context = ();

    fn add(lhs: &f64, rhs: &f64) -> f64 {
        lhs + rhs
    }

    fn zero(_: &()) -> f64 {
        0.0
    }

    fn one(_: &()) -> f64 {
        1.0
    }
}

type Scalar = Value<ScalarBackend>;

impl Graph<ScalarBackend> {
    /// Create a scalar leaf.
    pub fn scalar(&mut self, x: f64) -> Scalar {
        self.leaf(x, ())
    }

    /// `lhs * rhs`
    pub fn mul(&mut self, lhs: Scalar, rhs: Scalar) -> Result<Scalar, AutogradError> {
        self.apply_binary(
            lhs,
            rhs,
            |a, b| a * b,
            |g, grad, (_, rhs)| g.mul(grad, rhs),
            |g, grad, (lhs, _)| g.mul(grad, lhs),
            |_, _| (),
        )
    }

    /// `lhs - rhs`
    pub fn sub(&mut self, lhs: Scalar, rhs: Scalar) -> Result<Scalar, AutogradError> {
        self.apply_binary(
            lhs,
            rhs,
            |a, b| a - b,
            |_, grad, _| Ok(grad),
            |g, grad, _| g.neg(grad),
            |_, _| (),
        )
    }

    /// `lhs / rhs`
    pub fn div(&mut self, lhs: Scalar, rhs: Scalar) -> Result<Scalar, AutogradError> {
        self.apply_binary(
            lhs,
            rhs,
            |a, b| a / b,
            |g, grad, (_, rhs)| g.div(grad, rhs),
            |g, grad, (lhs, rhs)| {
                // -grad * lhs / rhs^2
                let numerator = g.mul(grad, lhs)?;
                let denominator = g.mul(rhs, rhs)?;
                let quotient = g.div(numerator, denominator)?;
                g.neg(quotient)
            },
            |_, _| (),
        )
    }

    /// `-x`
    pub fn neg(&mut self, x: Scalar) -> Result<Scalar, AutogradError> {
        self.apply_unary(x, |a| -a, |g, grad, _| g.neg(grad), |_| ())
    }

    /// `max(x, 0)`
    pub fn relu(&mut self, x: Scalar) -> Result<Scalar, AutogradError> {
        self.apply_unary(
            x,
            |a| a.max(0.0),
            |g, grad, input| {
                if g.data(input)? < 0.0 {
                    g.mul_scalar(grad, 0.0)
                } else {
                    Ok(grad)
                }
            },
            |_| (),
        )
    }

    /// `x + c`
    pub fn add_scalar(&mut self, x: Scalar, c: f64) -> Result<Scalar, AutogradError> {
        self.apply_unary(x, move |a| a + c, |_, grad, _| Ok(grad), |_| ())
    }

    /// `x - c`
    pub fn sub_scalar(&mut self, x: Scalar, c: f64) -> Result<Scalar, AutogradError> {
        self.apply_unary(x, move |a| a - c, |_, grad, _| Ok(grad), |_| ())
    }

    /// `x * c`
    pub fn mul_scalar(&mut self, x: Scalar, c: f64) -> Result<Scalar, AutogradError> {
        self.apply_unary(
            x,
            move |a| a * c,
            move |g, grad, _| g.mul_scalar(grad, c),
            |_| (),
        )
    }

    /// `x / c`
    pub fn div_scalar(&mut self, x: Scalar, c: f64) -> Result<Scalar, AutogradError> {
        self.apply_unary(
            x,
            move |a| a / c,
            move |g, grad, _| g.div_scalar(grad, c),
            |_| (),
        )
    }
}
