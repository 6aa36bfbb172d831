//! Configuration for a single backward pass.

/// Flags selecting graph retention and zeroing for one backward invocation.
///
/// Both flags default to `false`.
///
/// # Example
///
/// ```
/// use ndgrad::BackwardConfig;
///
/// let config = BackwardConfig::new().with_keep_graph(true);
/// assert!(config.keep_graph());
/// assert!(!config.zero_grad());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackwardConfig {
    keep_graph: bool,
    zero_grad: bool,
}

impl BackwardConfig {
    /// Create the default configuration (no retention, no zeroing).
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain the graph so gradients can themselves be differentiated.
    ///
    /// When set, backward functions see the live operands and the live
    /// incoming gradient. Otherwise they see detached snapshots, and the
    /// accumulated gradients carry no history back to the operands.
    pub fn with_keep_graph(self, keep_graph: bool) -> Self {
        Self { keep_graph, ..self }
    }

    /// Clear the accumulators of every visited node before seeding.
    pub fn with_zero_grad(self, zero_grad: bool) -> Self {
        Self { zero_grad, ..self }
    }

    /// Whether the graph is retained.
    pub fn keep_graph(&self) -> bool {
        self.keep_graph
    }

    /// Whether accumulators are cleared before the pass.
    pub fn zero_grad(&self) -> bool {
        self.zero_grad
    }
}
