//! Property-based tests for graph traversal and gradient correctness.
//!
//! Random expression DAGs are built over a few leaves, then checked against
//! plain `f64` evaluation and central finite differences.

use ndgrad::{Graph, NodeId, ScalarBackend, Value};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};

type G = Graph<ScalarBackend>;

/// One operation; operand indices are taken modulo the number of values
/// built so far, so any index picks an existing value.
#[derive(Debug, Clone)]
enum Op {
    Add(usize, usize),
    Sub(usize, usize),
    Mul(usize, usize),
    Neg(usize),
    AddScalar(usize, f64),
    MulScalar(usize, f64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<usize>(), any::<usize>()).prop_map(|(a, b)| Op::Add(a, b)),
        (any::<usize>(), any::<usize>()).prop_map(|(a, b)| Op::Sub(a, b)),
        (any::<usize>(), any::<usize>()).prop_map(|(a, b)| Op::Mul(a, b)),
        any::<usize>().prop_map(Op::Neg),
        (any::<usize>(), -2.0..2.0f64).prop_map(|(a, c)| Op::AddScalar(a, c)),
        (any::<usize>(), -2.0..2.0f64).prop_map(|(a, c)| Op::MulScalar(a, c)),
    ]
}

fn evaluate(leaves: &[f64], ops: &[Op]) -> f64 {
    let mut values = leaves.to_vec();
    for op in ops {
        let n = values.len();
        let value = match *op {
            Op::Add(a, b) => values[a % n] + values[b % n],
            Op::Sub(a, b) => values[a % n] - values[b % n],
            Op::Mul(a, b) => values[a % n] * values[b % n],
            Op::Neg(a) => -values[a % n],
            Op::AddScalar(a, c) => values[a % n] + c,
            Op::MulScalar(a, c) => values[a % n] * c,
        };
        values.push(value);
    }
    values[values.len() - 1]
}

fn build(graph: &mut G, leaves: &[f64], ops: &[Op]) -> Vec<Value<ScalarBackend>> {
    let mut values: Vec<_> = leaves
        .iter()
        .map(|&x| {
            let leaf = graph.scalar(x);
            graph.requires_grad_(leaf, true).unwrap()
        })
        .collect();
    for op in ops {
        let n = values.len();
        let value = match *op {
            Op::Add(a, b) => graph.add(values[a % n], values[b % n]),
            Op::Sub(a, b) => graph.sub(values[a % n], values[b % n]),
            Op::Mul(a, b) => graph.mul(values[a % n], values[b % n]),
            Op::Neg(a) => graph.neg(values[a % n]),
            Op::AddScalar(a, c) => graph.add_scalar(values[a % n], c),
            Op::MulScalar(a, c) => graph.mul_scalar(values[a % n], c),
        }
        .unwrap();
        values.push(value);
    }
    values
}

fn numerical_gradient(leaves: &[f64], ops: &[Op], eps: f64) -> Vec<f64> {
    let mut plus = leaves.to_vec();
    let mut minus = leaves.to_vec();
    (0..leaves.len())
        .map(|i| {
            plus[i] = leaves[i] + eps;
            minus[i] = leaves[i] - eps;
            let grad = (evaluate(&plus, ops) - evaluate(&minus, ops)) / (2.0 * eps);
            plus[i] = leaves[i];
            minus[i] = leaves[i];
            grad
        })
        .collect()
}

fn leaf_gradients(graph: &mut G, leaves: &[Value<ScalarBackend>]) -> Vec<f64> {
    leaves
        .iter()
        .map(|&leaf| match graph.grad(leaf).unwrap() {
            Some(grad) => graph.data(grad).unwrap(),
            None => 0.0,
        })
        .collect()
}

/// Leaf gradients after one pass from each root picked by `roots`.
///
/// Every root is a fresh `mul_scalar` over an existing value, so the roots
/// share the intermediate values they depend on.
fn accumulated_gradients(leaves: &[f64], ops: &[Op], roots: &[(usize, f64)]) -> Vec<f64> {
    let mut graph = G::new();
    let values = build(&mut graph, leaves, ops);
    for &(index, scale) in roots {
        let root = graph.mul_scalar(values[index % values.len()], scale).unwrap();
        graph.backward(root).unwrap();
    }
    leaf_gradients(&mut graph, &values[..leaves.len()])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Forward payloads match plain evaluation.
    #[test]
    fn prop_forward_matches_evaluation(
        leaves in prop::collection::vec(-1.5..1.5f64, 1..4),
        ops in prop::collection::vec(op_strategy(), 1..7),
    ) {
        let mut graph = G::new();
        let values = build(&mut graph, &leaves, &ops);
        let root = values[values.len() - 1];
        let expected = evaluate(&leaves, &ops);
        prop_assert!((graph.data(root).unwrap() - expected).abs() <= 1e-9 * (1.0 + expected.abs()));
    }

    /// Every reachable node appears once, after its predecessors, root last.
    #[test]
    fn prop_topological_order(
        leaves in prop::collection::vec(-1.5..1.5f64, 1..4),
        ops in prop::collection::vec(op_strategy(), 1..10),
    ) {
        let mut graph = G::new();
        let values = build(&mut graph, &leaves, &ops);
        let root = values[values.len() - 1];

        let order = graph.topological_order(root).unwrap();
        let position: HashMap<NodeId, usize> =
            order.iter().enumerate().map(|(i, &id)| (id, i)).collect();

        prop_assert_eq!(position.len(), order.len());
        prop_assert_eq!(order.last().copied(), Some(graph.node_id(root).unwrap()));
        for (i, &id) in order.iter().enumerate() {
            for prev in graph.forward_node(id).unwrap().prev() {
                let before = position.get(prev).copied();
                prop_assert!(matches!(before, Some(p) if p < i));
            }
        }
    }

    /// Backpropagated gradients match central finite differences, including
    /// leaves consumed several times.
    #[test]
    fn prop_gradients_match_finite_differences(
        leaves in prop::collection::vec(-1.5..1.5f64, 1..4),
        ops in prop::collection::vec(op_strategy(), 1..7),
    ) {
        let mut graph = G::new();
        let values = build(&mut graph, &leaves, &ops);
        let root = values[values.len() - 1];
        graph.backward(root).unwrap();

        let expected = numerical_gradient(&leaves, &ops, 1e-6);
        let scale = 1.0 + evaluate(&leaves, &ops).abs() * 1e-2;
        for (i, &leaf) in values[..leaves.len()].iter().enumerate() {
            let actual = match graph.grad(leaf).unwrap() {
                Some(grad) => graph.data(grad).unwrap(),
                None => 0.0,
            };
            prop_assert!(
                (actual - expected[i]).abs() <= 1e-4 * (scale + actual.abs()),
                "leaf {}: backprop {} vs numerical {}", i, actual, expected[i]
            );
        }
    }

    /// Two passes over shared intermediates accumulate the sum of the two
    /// single-pass gradients.
    #[test]
    fn prop_accumulated_passes_add_up(
        leaves in prop::collection::vec(-1.5..1.5f64, 1..4),
        ops in prop::collection::vec(op_strategy(), 1..7),
        first in (any::<usize>(), -2.0..2.0f64),
        second in (any::<usize>(), -2.0..2.0f64),
    ) {
        let both = accumulated_gradients(&leaves, &ops, &[first, second]);
        let only_first = accumulated_gradients(&leaves, &ops, &[first]);
        let only_second = accumulated_gradients(&leaves, &ops, &[second]);

        for i in 0..leaves.len() {
            let expected = only_first[i] + only_second[i];
            let scale = 1.0 + only_first[i].abs() + only_second[i].abs();
            prop_assert!(
                (both[i] - expected).abs() <= 1e-9 * scale,
                "leaf {}: accumulated {} vs {}", i, both[i], expected
            );
        }
    }

    /// Without graph retention, gradients never reference the leaves.
    #[test]
    fn prop_detached_gradients_have_no_leaf_history(
        leaves in prop::collection::vec(-1.5..1.5f64, 1..4),
        ops in prop::collection::vec(op_strategy(), 1..7),
    ) {
        let mut graph = G::new();
        let values = build(&mut graph, &leaves, &ops);
        let root = values[values.len() - 1];
        graph.backward(root).unwrap();

        let leaf_ids: HashSet<NodeId> = values[..leaves.len()]
            .iter()
            .map(|&leaf| graph.node_id(leaf).unwrap())
            .collect();
        for &leaf in &values[..leaves.len()] {
            if let Some(grad) = graph.grad(leaf).unwrap() {
                let order = graph.topological_order(grad).unwrap();
                prop_assert!(order.iter().all(|id| !leaf_ids.contains(id)));
            }
            prop_assert!(graph.node(leaf).unwrap().is_leaf());
        }
    }
}
