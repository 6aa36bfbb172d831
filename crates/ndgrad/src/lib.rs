//! ndgrad - reverse-mode automatic differentiation over opaque payloads
//!
//! Forward operations build a DAG of values; `backward` walks it once in
//! reverse topological order and accumulates chain-rule contributions into
//! every value that requires a gradient.
//!
//! # Architecture
//!
//! ```text
//! Graph<B: Backend>            arena owning every value
//!     ├── Value<B>             Copy handle, redirectable by swap_with
//!     ├── ForwardNode<B>       predecessors + backward function
//!     └── GradNode<B>          gradient accumulator (+ native gradient)
//!
//! ops        apply_binary / apply_unary / add / add_to_grad
//! backward   topological order, seeding, reverse replay
//! registry   leak detection for values owning native state
//! scalar     reference f64 backend
//! ```
//!
//! The engine only needs addition and the two identity elements from a
//! payload type (see [`Backend`]); every other operator supplies its own
//! forward and backward closures.
//!
//! # Example
//!
//! Gradients can themselves be differentiated when the graph is kept:
//!
//! ```
//! use approx::assert_relative_eq;
//! use ndgrad::{BackwardConfig, Graph, ScalarBackend};
//!
//! let mut graph: Graph<ScalarBackend> = Graph::new();
//! let x = graph.scalar(0.5);
//! let y = graph.scalar(0.6);
//! graph.requires_grad_(x, true).unwrap();
//! graph.requires_grad_(y, true).unwrap();
//!
//! // z = x^2 + xy + y^2
//! let xx = graph.mul(x, x).unwrap();
//! let yx = graph.mul(y, x).unwrap();
//! let yy = graph.mul(y, y).unwrap();
//! let z = graph.add(xx, yx).unwrap();
//! let z = graph.add(z, yy).unwrap();
//!
//! graph
//!     .backward_with_config(z, &BackwardConfig::new().with_keep_graph(true))
//!     .unwrap();
//! let dx = graph.grad(x).unwrap().unwrap();
//! let dy = graph.grad(y).unwrap().unwrap();
//! assert_relative_eq!(graph.data(dx).unwrap(), 1.6, epsilon = 1e-12);
//! assert_relative_eq!(graph.data(dy).unwrap(), 1.7, epsilon = 1e-12);
//!
//! // Differentiate 2 * dz/dx + dz/dy; the new gradients land behind the
//! // same handles.
//! let twice = graph.mul_scalar(dx, 2.0).unwrap();
//! let grad_sum = graph.add(twice, dy).unwrap();
//! graph.backward(grad_sum).unwrap();
//!
//! assert_eq!(graph.grad(x).unwrap(), Some(dx));
//! assert_eq!(graph.grad(y).unwrap(), Some(dy));
//! assert_relative_eq!(graph.data(dx).unwrap(), 6.6, epsilon = 1e-12);
//! assert_relative_eq!(graph.data(dy).unwrap(), 5.7, epsilon = 1e-12);
//! ```

pub mod adapter;
pub mod backend;
pub mod backward;
pub mod config;
pub mod error;
pub mod graph;
pub mod lazy;
pub mod node;
pub mod ops;
pub mod registry;
pub mod scalar;

pub use adapter::{AdaptedBackwardFn, NodeAdapter};
pub use backend::Backend;
pub use config::BackwardConfig;
pub use error::AutogradError;
pub use graph::{Graph, Value};
pub use lazy::{LazyPayload, Producer};
pub use node::{BackwardFn, ForwardNode, GradNode, NativeGradFn, NodeId, Predecessors};
pub use registry::{Registries, Registry, RegistryStatus, Resource};
pub use scalar::ScalarBackend;
