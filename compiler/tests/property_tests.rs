// Property-based tests for model invariants.
//
// Four categories:
// 1. Traversal: random DAGs visit every reachable node once, producers first
// 2. Transformation: copies map every output and preserve computed values
// 3. Refinement: a refined model is a fixed point of one more pass
// 4. Archives and compilation: reloaded and compiled maps compute the same
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use emc::archive::{load_map, save_map};
use emc::emitter::BinaryOp;
use emc::nodes::{BinaryOperationNode, ConstantNode, DenseLayerNode, InputNode};
use emc::transformer::{copy_model, refine_model, refine_once};
use emc::{Map, MapCompilerOptions, Model, NodeId, PortMemoryLayout, PortType, PortValue};
use proptest::prelude::*;

// ── Random DAG generator ────────────────────────────────────────────────────

/// Recipe for a random elementwise DAG: `inputs` real64 inputs of `width`
/// elements, one constant, then one binary operation per `ops` entry whose
/// operands are picked among all earlier nodes.
#[derive(Debug, Clone)]
struct DagRecipe {
    width: usize,
    inputs: usize,
    constant: Vec<i32>,
    ops: Vec<(usize, usize, usize)>,
    values: Vec<i32>,
}

fn arb_dag() -> impl Strategy<Value = DagRecipe> {
    (1usize..5, 1usize..4).prop_flat_map(|(width, inputs)| {
        (
            Just(width),
            Just(inputs),
            prop::collection::vec(-3i32..4, width),
            prop::collection::vec((0usize..3, any::<usize>(), any::<usize>()), 1..8),
            prop::collection::vec(-3i32..4, width * inputs),
        )
            .prop_map(|(width, inputs, constant, ops, values)| DagRecipe {
                width,
                inputs,
                constant,
                ops,
                values,
            })
    })
}

const OPS: [BinaryOp; 3] = [BinaryOp::Add, BinaryOp::Subtract, BinaryOp::Multiply];

struct BuiltDag {
    map: Map,
    /// Every node in creation order.
    nodes: Vec<NodeId>,
    arguments: Vec<PortValue>,
}

fn build_dag(recipe: &DagRecipe) -> BuiltDag {
    let mut model = Model::new();
    let mut nodes = Vec::new();
    let mut inputs = Vec::new();
    for i in 0..recipe.inputs {
        let id = model
            .add_node(InputNode::new(PortType::Real64, PortMemoryLayout::flat(recipe.width)))
            .unwrap();
        inputs.push((format!("x{}", i), id));
        nodes.push(id);
    }
    let constant: Vec<f64> = recipe.constant.iter().map(|&v| v as f64).collect();
    nodes.push(model.add_node(ConstantNode::new(constant)).unwrap());
    for &(op, lhs, rhs) in &recipe.ops {
        let a = model.port_elements(nodes[lhs % nodes.len()].port(0)).unwrap();
        let b = model.port_elements(nodes[rhs % nodes.len()].port(0)).unwrap();
        let id = model
            .add_node(BinaryOperationNode::new(OPS[op], a, b).unwrap())
            .unwrap();
        nodes.push(id);
    }
    let last = *nodes.last().unwrap();
    let output = model.port_elements(last.port(0)).unwrap();
    let arguments = recipe
        .values
        .chunks(recipe.width)
        .map(|chunk| PortValue::from(chunk.iter().map(|&v| v as f64).collect::<Vec<_>>()))
        .collect();
    BuiltDag {
        map: Map::new(model, inputs, output).unwrap(),
        nodes,
        arguments,
    }
}

// ── Traversal ───────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn reachable_nodes_are_topologically_ordered(recipe in arb_dag()) {
        let dag = build_dag(&recipe);
        let model = dag.map.model();
        let root = *dag.nodes.last().unwrap();
        let order = model.reachable_from(&[root]).unwrap();

        prop_assert_eq!(order.last().copied(), Some(root));
        for (pos, &id) in order.iter().enumerate() {
            prop_assert!(!order[..pos].contains(&id), "{} visited twice", id);
            for dep in model.dependencies(id).unwrap() {
                let dep_pos = order.iter().position(|&n| n == dep);
                prop_assert!(
                    matches!(dep_pos, Some(p) if p < pos),
                    "{} visited before its producer {}", id, dep
                );
            }
        }
    }

    #[test]
    fn full_order_covers_every_node(recipe in arb_dag()) {
        let dag = build_dag(&recipe);
        let order = dag.map.model().topological_order();
        prop_assert_eq!(order.len(), dag.nodes.len());
        let mut sorted = order.clone();
        sorted.sort();
        sorted.dedup();
        prop_assert_eq!(sorted.len(), order.len());
    }
}

// ── Transformation ──────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn copy_maps_every_output(recipe in arb_dag()) {
        let dag = build_dag(&recipe);
        let copied = copy_model(dag.map.model()).unwrap();
        prop_assert_eq!(copied.model.len(), dag.nodes.len());
        for &id in &dag.nodes {
            let old = dag.map.model().port_elements(id.port(0)).unwrap();
            let new = copied.transform_elements(&old).unwrap();
            prop_assert_eq!(new.size(), old.size());
            prop_assert_eq!(new.port_type(), old.port_type());
        }
    }

    #[test]
    fn copied_map_computes_the_same(recipe in arb_dag()) {
        let dag = build_dag(&recipe);
        let copied = dag.map.transformed(copy_model(dag.map.model()).unwrap()).unwrap();
        prop_assert_eq!(
            copied.compute(&dag.arguments).unwrap(),
            dag.map.compute(&dag.arguments).unwrap()
        );
    }
}

// ── Refinement ──────────────────────────────────────────────────────────────

fn arb_dense() -> impl Strategy<Value = (usize, usize, Vec<i32>)> {
    (1usize..5, 1usize..5).prop_flat_map(|(rows, cols)| {
        (
            Just(rows),
            Just(cols),
            prop::collection::vec(-3i32..4, rows * cols + rows),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 50,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn refinement_reaches_a_fixed_point((rows, cols, params) in arb_dense()) {
        let mut model = Model::new();
        let x = model
            .add_node(InputNode::new(PortType::Real64, PortMemoryLayout::flat(cols)))
            .unwrap();
        let weights: Vec<f64> = params[..rows * cols].iter().map(|&v| v as f64).collect();
        let bias: Vec<f64> = params[rows * cols..].iter().map(|&v| v as f64).collect();
        let dense = DenseLayerNode::new(model.port_elements(x.port(0)).unwrap(), rows, cols, weights, bias)
            .unwrap();
        model.add_node(dense).unwrap();

        let refined = refine_model(&model, 16).unwrap();
        let (again, decomposed) = refine_once(&refined.model).unwrap();
        prop_assert_eq!(decomposed, 0);
        prop_assert_eq!(again.model.len(), refined.model.len());
        prop_assert!(refined.model.iter().all(|(_, node)| !node.capabilities().refinable));
    }
}

// ── Archives and compilation ────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 50,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn archive_roundtrip_preserves_map(recipe in arb_dag()) {
        let dag = build_dag(&recipe);
        let loaded = load_map(&save_map(&dag.map).unwrap()).unwrap();
        prop_assert_eq!(&loaded, &dag.map);
        prop_assert_eq!(
            loaded.compute(&dag.arguments).unwrap(),
            dag.map.compute(&dag.arguments).unwrap()
        );
    }

    #[test]
    fn compiled_kernel_matches_interpreter(recipe in arb_dag()) {
        let dag = build_dag(&recipe);
        let compiled = dag.map.compile(&MapCompilerOptions::default()).unwrap();
        prop_assert_eq!(
            compiled.compute(&dag.arguments).unwrap(),
            dag.map.compute(&dag.arguments).unwrap()
        );
    }
}
