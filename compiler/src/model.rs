// model.rs — DAG container: node arena, insertion rule, traversal
//
// A `Model` owns its nodes in an arena indexed by `NodeId`. Insertion is the
// only way to add a node, and it rejects any input range that does not resolve
// to an existing output of this model. Since references can only point
// backwards, every model is acyclic and id order is a topological order.
//
// Preconditions: none; an empty model is valid.
// Postconditions: after `add_node` succeeds, every input range of the new node
//   names an existing output, with matching element type, in bounds.
// Failure modes: `Construction` for dangling, forward, mistyped or
//   out-of-bounds references; nothing is inserted on failure.

use std::fmt;

use tracing::trace;

use crate::error::{GraphError, Result};
use crate::id::{IdAllocator, NodeId, PortRef};
use crate::layout::PortMemoryLayout;
use crate::node::Node;
use crate::port::{OutputPort, PortElements};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Model {
    nodes: Vec<Node>,
    ids: IdAllocator,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Open,
    Done,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert `node` and return its handle.
    pub fn add_node(&mut self, node: Node) -> Result<NodeId> {
        for input in node.inputs() {
            for range in input.elements().ranges() {
                let out = self.output_port(range.port).map_err(|_| {
                    GraphError::Construction(format!(
                        "{} input '{}' references {}, which is not in this model",
                        node.type_name(),
                        input.name(),
                        range.port
                    ))
                })?;
                if out.port_type() != input.port_type() {
                    return Err(GraphError::Construction(format!(
                        "{} input '{}' is {} but {} is {}",
                        node.type_name(),
                        input.name(),
                        input.port_type(),
                        range.port,
                        out.port_type()
                    )));
                }
                if range.end() > out.size() {
                    return Err(GraphError::Construction(format!(
                        "{} input '{}' reads {} past the {} elements of {}",
                        node.type_name(),
                        input.name(),
                        range,
                        out.size(),
                        range.port
                    )));
                }
            }
        }
        let id = self.ids.alloc_node();
        trace!(node = %id, kind = node.base_name(), "node added");
        self.nodes.push(node);
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    /// Like `node`, but a missing id is an error.
    pub fn get(&self, id: NodeId) -> Result<&Node> {
        self.node(id)
            .ok_or_else(|| GraphError::Construction(format!("{} is not in this model", id)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeId(i as u32), n))
    }

    pub fn output_port(&self, port: PortRef) -> Result<&OutputPort> {
        self.get(port.node)?
            .output(port.index)
            .ok_or_else(|| GraphError::Construction(format!("{} has no output {}", port.node, port.index)))
    }

    /// Whole-port selection of `port`.
    pub fn port_elements(&self, port: PortRef) -> Result<PortElements> {
        self.get(port.node)?
            .output_elements(port.node, port.index)
            .ok_or_else(|| GraphError::Construction(format!("{} has no output {}", port.node, port.index)))
    }

    /// Nodes whose outputs `id` reads, in input order, without duplicates.
    pub fn dependencies(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let mut deps: Vec<NodeId> = Vec::new();
        for input in self.get(id)?.inputs() {
            for dep in input.elements().referenced_nodes() {
                if !deps.contains(&dep) {
                    deps.push(dep);
                }
            }
        }
        Ok(deps)
    }

    /// Every node reachable from `roots`, each once, dependencies first.
    pub fn reachable_from(&self, roots: &[NodeId]) -> Result<Vec<NodeId>> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut order = Vec::new();
        let mut stack: Vec<(NodeId, bool)> = Vec::new();
        for &root in roots {
            self.get(root)?;
            stack.push((root, false));
            while let Some((id, expanded)) = stack.pop() {
                if expanded {
                    marks[id.index()] = Mark::Done;
                    order.push(id);
                    continue;
                }
                if marks[id.index()] != Mark::Unvisited {
                    continue;
                }
                marks[id.index()] = Mark::Open;
                stack.push((id, true));
                for dep in self.dependencies(id)?.into_iter().rev() {
                    if marks[dep.index()] == Mark::Unvisited {
                        stack.push((dep, false));
                    }
                }
            }
        }
        Ok(order)
    }

    /// Call `visitor` on every node reachable from `roots` in topological order.
    pub fn visit(
        &self,
        roots: &[NodeId],
        mut visitor: impl FnMut(NodeId, &Node) -> Result<()>,
    ) -> Result<()> {
        for id in self.reachable_from(roots)? {
            visitor(id, self.get(id)?)?;
        }
        Ok(())
    }

    /// All nodes in a valid topological order.
    pub fn topological_order(&self) -> Vec<NodeId> {
        (0..self.nodes.len() as u32).map(NodeId).collect()
    }

    /// Check every declared input layout against the producer's output
    /// layout. Only inputs bound to one whole output port are checked; any
    /// other selection has already been gathered into a flat buffer.
    /// Layouts of equal rank must agree on logical order; layouts of
    /// different rank are only compatible when both are plain row-major.
    pub fn validate_layouts(&self) -> Result<()> {
        for (id, node) in self.iter() {
            for (index, layout) in node.input_layouts() {
                let Some(input) = node.input(index) else {
                    continue;
                };
                let Some(range) = input.elements().single_range() else {
                    continue;
                };
                let producer = self.output_port(range.port)?;
                if range.start != 0 || range.count != producer.size() {
                    continue;
                }
                if !layouts_compatible(producer.layout(), layout) {
                    let found = producer.layout().logical_dimension_order();
                    let expected = layout.logical_dimension_order();
                    return Err(GraphError::LayoutMismatch {
                        node: id,
                        input: input.name().to_string(),
                        expected: expected.clone(),
                        found: found.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn layouts_compatible(found: &PortMemoryLayout, expected: &PortMemoryLayout) -> bool {
    if found.rank() == expected.rank() {
        return found.logical_dimension_order() == expected.logical_dimension_order();
    }
    let row_major = |l: &PortMemoryLayout| l.logical_dimension_order().is_canonical() && !l.has_padding();
    row_major(found) && row_major(expected)
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Model ({} nodes)", self.nodes.len())?;
        for (id, node) in self.iter() {
            writeln!(f, "  {} = {}", id, node)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::BinaryOp;
    use crate::layout::{PortMemoryLayout, PortType};
    use crate::nodes::{BinaryOperationNode, ConstantNode, InputNode, OutputNode};
    use crate::port::PortRange;

    #[test]
    fn forward_reference_is_rejected() {
        let mut model = Model::new();
        let dangling = PortElements::from_ranges(
            PortType::Real32,
            [PortRange::new(NodeId(0).port(0), 0, 2)],
        );
        let err = model.add_node(OutputNode::new(dangling)).unwrap_err();
        assert!(matches!(err, GraphError::Construction(_)));
        assert!(model.is_empty());
    }

    #[test]
    fn out_of_bounds_range_is_rejected() {
        let mut model = Model::new();
        let c = model.add_node(ConstantNode::new(vec![1.0f32, 2.0])).unwrap();
        let past = PortElements::from_ranges(PortType::Real32, [PortRange::new(c.port(0), 1, 2)]);
        assert!(model.add_node(OutputNode::new(past)).is_err());
        assert_eq!(model.len(), 1);
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let mut model = Model::new();
        let c = model.add_node(ConstantNode::new(vec![1i32, 2])).unwrap();
        let wrong = PortElements::from_ranges(PortType::Real32, [PortRange::new(c.port(0), 0, 2)]);
        assert!(model.add_node(OutputNode::new(wrong)).is_err());
    }

    #[test]
    fn visit_orders_dependencies_first_and_once() {
        let mut model = Model::new();
        let a = model.add_node(InputNode::new(PortType::Real64, PortMemoryLayout::flat(2))).unwrap();
        let unused = model.add_node(ConstantNode::new(vec![0.0f64])).unwrap();
        let ea = model.port_elements(a.port(0)).unwrap();
        let sq = model
            .add_node(BinaryOperationNode::new(BinaryOp::Multiply, ea.clone(), ea).unwrap())
            .unwrap();
        let out = model
            .add_node(OutputNode::new(model.port_elements(sq.port(0)).unwrap()))
            .unwrap();
        let mut seen = Vec::new();
        model
            .visit(&[out, sq], |id, _| {
                seen.push(id);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![a, sq, out]);
        assert!(!seen.contains(&unused));
    }

    #[test]
    fn display_lists_nodes() {
        let mut model = Model::new();
        let c = model.add_node(ConstantNode::new(vec![1.0f32, 2.0])).unwrap();
        model
            .add_node(OutputNode::new(model.port_elements(c.port(0)).unwrap()))
            .unwrap();
        assert_eq!(
            model.to_string(),
            "Model (2 nodes)\n  n0 = ConstantNode<real32>() -> output: real32[2]\n  n1 = OutputNode<real32>(n0:0[0..2]) -> output: real32[2]\n"
        );
    }
}
