// passes.rs — Built-in optimization passes
//
// Each pass claims one node shape and copies everything else through.

use tracing::trace;

use crate::compiler::MapCompilerOptions;
use crate::compute::ComputeContext;
use crate::error::{GraphError, Result};
use crate::id::NodeId;
use crate::node::Node;
use crate::nodes::{ConstantNode, InputNode, NodeKind, OutputNode};
use crate::pass::{OptimizationPass, OptimizerContext};
use crate::port::OutputPort;

fn copy_through(node: &Node, id: NodeId, ctx: &mut OptimizerContext<'_>) -> Result<()> {
    node.copy(id, ctx.transformer()).map(|_| ())
}

/// Replace `new_node`'s output 0 for `id`'s output 0 in the target.
fn replace_with(new_node: Node, id: NodeId, ctx: &mut OptimizerContext<'_>) -> Result<()> {
    let t = ctx.transformer();
    let new_id = t.add_node(new_node)?;
    let elements = t.target().port_elements(new_id.port(0))?;
    t.map_node_output(id.port(0), elements);
    Ok(())
}

fn sole_output(node: &Node) -> Result<&OutputPort> {
    node.output(0)
        .ok_or_else(|| GraphError::Construction(format!("{} has no output port", node.type_name())))
}

// ── ReplaceSourceAndSinkNodesPass ──────────────────────────────────────────

/// Source nodes become map inputs and sink nodes become outputs; the emitted
/// kernel takes and returns buffers instead of calling back.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceSourceAndSinkNodesPass;

impl OptimizationPass for ReplaceSourceAndSinkNodesPass {
    fn name(&self) -> &'static str {
        "replace_source_and_sink_nodes"
    }

    fn optimize_node(
        &self,
        node: &Node,
        id: NodeId,
        _options: &MapCompilerOptions,
        ctx: &mut OptimizerContext<'_>,
    ) -> Result<()> {
        match node.kind() {
            NodeKind::Source(source) => {
                let out = sole_output(node)?;
                trace!(node = %id, callback = source.callback(), "source replaced by input");
                replace_with(InputNode::new(out.port_type(), out.layout().clone()), id, ctx)
            }
            NodeKind::Sink(sink) => {
                let port = node
                    .input(0)
                    .ok_or_else(|| GraphError::Construction("SinkNode has no input".into()))?;
                let elements = ctx.transformer().transform_port_elements(port.elements())?;
                trace!(node = %id, callback = sink.callback(), "sink replaced by output");
                let layout = sole_output(node)?.layout().clone();
                replace_with(OutputNode::with_layout(elements, layout)?, id, ctx)
            }
            _ => copy_through(node, id, ctx),
        }
    }
}

// ── RemoveIdentityReorderPass ──────────────────────────────────────────────

/// A reorder whose input and output layouts are equal is a plain copy; its
/// consumers read the producer directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveIdentityReorderPass;

impl OptimizationPass for RemoveIdentityReorderPass {
    fn name(&self) -> &'static str {
        "remove_identity_reorder"
    }

    fn optimize_node(
        &self,
        node: &Node,
        id: NodeId,
        _options: &MapCompilerOptions,
        ctx: &mut OptimizerContext<'_>,
    ) -> Result<()> {
        let NodeKind::ReorderData(reorder) = node.kind() else {
            return copy_through(node, id, ctx);
        };
        if !reorder.is_identity() {
            return copy_through(node, id, ctx);
        }
        let port = node
            .input(0)
            .ok_or_else(|| GraphError::Construction("ReorderDataNode has no input".into()))?;
        let t = ctx.transformer();
        let elements = t.transform_port_elements(port.elements())?;
        trace!(node = %id, "identity reorder removed");
        t.map_node_output(id.port(0), elements);
        Ok(())
    }
}

// ── FoldConstantOperationsPass ─────────────────────────────────────────────

/// Elementwise operations and casts whose inputs all come from constants are
/// evaluated once and replaced by a constant with the same output layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct FoldConstantOperationsPass;

impl FoldConstantOperationsPass {
    fn is_foldable(node: &Node) -> bool {
        matches!(node.kind(), NodeKind::BinaryOperation(_) | NodeKind::TypeCast(_))
    }
}

impl OptimizationPass for FoldConstantOperationsPass {
    fn name(&self) -> &'static str {
        "fold_constant_operations"
    }

    fn optimize_node(
        &self,
        node: &Node,
        id: NodeId,
        _options: &MapCompilerOptions,
        ctx: &mut OptimizerContext<'_>,
    ) -> Result<()> {
        if !Self::is_foldable(node) {
            return copy_through(node, id, ctx);
        }
        let source = ctx.source();
        let mut producers: Vec<NodeId> = Vec::new();
        for port in node.inputs() {
            for dep in port.elements().referenced_nodes() {
                if !producers.contains(&dep) {
                    producers.push(dep);
                }
            }
        }
        let all_constant = producers
            .iter()
            .map(|&p| source.get(p))
            .collect::<Result<Vec<_>>>()?
            .iter()
            .all(|n| matches!(n.kind(), NodeKind::Constant(_)));
        if !all_constant {
            return copy_through(node, id, ctx);
        }

        let mut values = ComputeContext::new();
        for &p in &producers {
            source.get(p)?.compute(p, &mut values)?;
        }
        node.compute(id, &mut values)?;
        let folded = values
            .output(id.port(0))
            .cloned()
            .ok_or(GraphError::MissingValue { port: id.port(0) })?;
        let layout = sole_output(node)?.layout().clone();
        trace!(node = %id, kind = node.base_name(), "folded into constant");
        replace_with(ConstantNode::with_layout(folded, layout)?, id, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::BinaryOp;
    use crate::layout::{PortMemoryLayout, PortType};
    use crate::model::Model;
    use crate::nodes::{BinaryOperationNode, ReorderDataNode, SinkNode, SourceNode};
    use crate::pass::ModelOptimizer;
    use crate::value::PortValue;

    fn run(pass: impl OptimizationPass + 'static, model: &Model) -> crate::transformer::TransformedModel {
        let optimizer = ModelOptimizer::with_passes(vec![Box::new(pass)]);
        optimizer.optimize(model, &MapCompilerOptions::default()).unwrap()
    }

    #[test]
    fn sources_and_sinks_become_inputs_and_outputs() {
        let mut model = Model::new();
        let s = model
            .add_node(SourceNode::new("read_sensor", PortType::Real32, PortMemoryLayout::flat(2)))
            .unwrap();
        let k = model
            .add_node(SinkNode::new(model.port_elements(s.port(0)).unwrap(), "publish"))
            .unwrap();
        let result = run(ReplaceSourceAndSinkNodesPass, &model);
        let input = result.transform_node(s).unwrap();
        let output = result.transform_node(k).unwrap();
        assert!(matches!(result.model.get(input).unwrap().kind(), NodeKind::Input(_)));
        assert!(matches!(result.model.get(output).unwrap().kind(), NodeKind::Output(_)));
    }

    #[test]
    fn identity_reorder_is_bypassed() {
        let mut model = Model::new();
        let c = model.add_node(ConstantNode::new(vec![1.0f32, 2.0])).unwrap();
        let r = model
            .add_node(
                ReorderDataNode::new(
                    model.port_elements(c.port(0)).unwrap(),
                    PortMemoryLayout::flat(2),
                    PortMemoryLayout::flat(2),
                    0.0,
                )
                .unwrap(),
            )
            .unwrap();
        let result = run(RemoveIdentityReorderPass, &model);
        assert_eq!(result.model.len(), 1);
        assert_eq!(result.transform_node(r).unwrap(), result.transform_node(c).unwrap());
    }

    #[test]
    fn padded_reorder_is_kept() {
        let padded = PortMemoryLayout::padded(vec![2], 1, 1).unwrap();
        let mut model = Model::new();
        let c = model
            .add_node(ConstantNode::with_layout(vec![9.0f32, 1.0, 2.0, 9.0], padded.clone()).unwrap())
            .unwrap();
        let r = model
            .add_node(
                ReorderDataNode::new(model.port_elements(c.port(0)).unwrap(), padded.clone(), padded, 0.0)
                    .unwrap(),
            )
            .unwrap();
        let result = run(RemoveIdentityReorderPass, &model);
        assert_eq!(result.model.len(), 2);
        assert_ne!(result.transform_node(r).unwrap(), result.transform_node(c).unwrap());
    }

    #[test]
    fn constant_addition_is_folded() {
        let mut model = Model::new();
        let a = model.add_node(ConstantNode::new(vec![1i32, 2])).unwrap();
        let b = model.add_node(ConstantNode::new(vec![10i32, 20])).unwrap();
        let sum = model
            .add_node(
                BinaryOperationNode::new(
                    BinaryOp::Add,
                    model.port_elements(a.port(0)).unwrap(),
                    model.port_elements(b.port(0)).unwrap(),
                )
                .unwrap(),
            )
            .unwrap();
        let result = run(FoldConstantOperationsPass, &model);
        let folded = result.transform_node(sum).unwrap();
        match result.model.get(folded).unwrap().kind() {
            NodeKind::Constant(c) => assert_eq!(c.values(), &PortValue::from(vec![11i32, 22])),
            other => panic!("expected a constant, got {:?}", other),
        }
    }

    #[test]
    fn operation_on_input_is_kept() {
        let mut model = Model::new();
        let x = model
            .add_node(InputNode::new(PortType::Real64, PortMemoryLayout::flat(1)))
            .unwrap();
        let c = model.add_node(ConstantNode::new(vec![2.0f64])).unwrap();
        let m = model
            .add_node(
                BinaryOperationNode::new(
                    BinaryOp::Multiply,
                    model.port_elements(x.port(0)).unwrap(),
                    model.port_elements(c.port(0)).unwrap(),
                )
                .unwrap(),
            )
            .unwrap();
        let result = run(FoldConstantOperationsPass, &model);
        let kept = result.transform_node(m).unwrap();
        assert!(matches!(
            result.model.get(kept).unwrap().kind(),
            NodeKind::BinaryOperation(_)
        ));
    }
}
