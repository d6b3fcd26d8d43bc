// Snapshot tests: lock textual model, DOT and kernel output.
//
// Builds small maps through the library API and snapshots the Display, DOT
// and emitted C text. Snapshots are managed by `insta` and stored under
// `compiler/tests/snapshots/`.
//
// Run `cargo insta review` after intentional output changes to update baselines.

use emc::dot::emit_dot;
use emc::emitter::BinaryOp;
use emc::nodes::{BinaryOperationNode, DenseLayerNode, InputNode, OutputNode};
use emc::{Map, MapCompilerOptions, Model, NodeId, PortElements, PortMemoryLayout, PortType};

fn whole(model: &Model, id: NodeId) -> PortElements {
    model.port_elements(id.port(0)).unwrap()
}

fn adder() -> Map {
    let mut model = Model::new();
    let a = model
        .add_node(InputNode::new(PortType::Real32, PortMemoryLayout::flat(3)))
        .unwrap();
    let b = model
        .add_node(InputNode::new(PortType::Real32, PortMemoryLayout::flat(3)))
        .unwrap();
    let sum = model
        .add_node(BinaryOperationNode::new(BinaryOp::Add, whole(&model, a), whole(&model, b)).unwrap())
        .unwrap();
    let out = model.add_node(OutputNode::new(whole(&model, sum))).unwrap();
    let output = whole(&model, out);
    Map::new(model, [("a".to_string(), a), ("b".to_string(), b)], output).unwrap()
}

fn dense() -> Map {
    let mut model = Model::new();
    let x = model
        .add_node(InputNode::new(PortType::Real32, PortMemoryLayout::flat(2)))
        .unwrap();
    let d = model
        .add_node(
            DenseLayerNode::new(
                whole(&model, x),
                2,
                2,
                vec![1.0f32, 2.0, 3.0, 4.0],
                vec![0.5f32, -0.5],
            )
            .unwrap(),
        )
        .unwrap();
    let output = whole(&model, d);
    Map::new(model, [("x".to_string(), x)], output).unwrap()
}

fn snapshot(snap_name: &str, output: String) {
    insta::assert_snapshot!(snap_name, output);
}

#[test]
fn snapshot_adder_model() {
    snapshot("adder_model", adder().model().to_string());
}

#[test]
fn snapshot_adder_kernel() {
    let compiled = adder().compile(&MapCompilerOptions::default()).unwrap();
    snapshot("adder_kernel", compiled.source());
}

#[test]
fn snapshot_refined_dense_model() {
    let refined = dense().refine(None).unwrap();
    snapshot("refined_dense_model", refined.model().to_string());
}

#[test]
fn snapshot_refined_dense_dot() {
    let refined = dense().refine(None).unwrap();
    snapshot("refined_dense_dot", emit_dot(refined.model()));
}
