// transformer.rs — Rewrite engine: remap table, Copy/Refine driving loop, fixed point
//
// A `ModelTransformer` lives for exactly one pass. It builds a fresh target
// model while recording, for every output of every visited source node, the
// PortElements that now carry the same values. Consumers visited later look
// their inputs up in that table, so the walk must follow topological order.
//
// Preconditions: the source model is acyclic (guaranteed by `Model::add_node`).
// Postconditions: `finish` succeeds only if every visited output was mapped
//   exactly once to elements of the same type and size.
// Failure modes: `UnmappedReference` during a lookup, `MappingContract` at the
//   end of the pass, `RefinementNonConvergence` from `refine_model`.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, info};

use crate::error::{GraphError, Result};
use crate::id::{NodeId, PortRef};
use crate::model::Model;
use crate::node::Node;
use crate::port::PortElements;

/// Remap table from source outputs to target elements.
pub type PortMap = HashMap<PortRef, PortElements>;

fn lookup(map: &PortMap, elements: &PortElements) -> Result<PortElements> {
    let mut result = PortElements::empty(elements.port_type());
    for range in elements.ranges() {
        let mapped = map
            .get(&range.port)
            .ok_or(GraphError::UnmappedReference { port: range.port })?;
        result.append(&mapped.slice(range.start, range.count)?)?;
    }
    Ok(result)
}

pub struct ModelTransformer {
    target: Model,
    port_map: PortMap,
    violations: Vec<GraphError>,
}

impl Default for ModelTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelTransformer {
    pub fn new() -> Self {
        ModelTransformer {
            target: Model::new(),
            port_map: HashMap::new(),
            violations: Vec::new(),
        }
    }

    /// The model under construction.
    pub fn target(&self) -> &Model {
        &self.target
    }

    pub fn add_node(&mut self, node: Node) -> Result<NodeId> {
        self.target.add_node(node)
    }

    /// Rewrite source elements into target elements, range by range.
    pub fn transform_port_elements(&self, elements: &PortElements) -> Result<PortElements> {
        lookup(&self.port_map, elements)
    }

    /// Record that source output `old` is now carried by `new`. A second
    /// mapping for the same output is kept out of the table and reported by
    /// `finish`.
    pub fn map_node_output(&mut self, old: PortRef, new: PortElements) {
        if self.port_map.contains_key(&old) {
            self.violations.push(GraphError::MappingContract {
                port: old,
                reason: "mapped more than once".into(),
            });
            return;
        }
        self.port_map.insert(old, new);
    }

    pub fn is_mapped(&self, old: PortRef) -> bool {
        self.port_map.contains_key(&old)
    }

    /// Close the pass: every output of every node in `visited` must be mapped
    /// once, to elements of its own type and size.
    pub fn finish(mut self, source: &Model, visited: &[NodeId]) -> Result<TransformedModel> {
        if !self.violations.is_empty() {
            return Err(self.violations.swap_remove(0));
        }
        for &id in visited {
            let node = source.get(id)?;
            for (index, out) in node.outputs().iter().enumerate() {
                let port = id.port(index);
                let mapped = self.port_map.get(&port).ok_or_else(|| GraphError::MappingContract {
                    port,
                    reason: "never mapped".into(),
                })?;
                if mapped.port_type() != out.port_type() || mapped.size() != out.size() {
                    return Err(GraphError::MappingContract {
                        port,
                        reason: format!(
                            "mapped to {} {} elements, output has {} {}",
                            mapped.size(),
                            mapped.port_type(),
                            out.size(),
                            out.port_type()
                        ),
                    });
                }
            }
        }
        Ok(TransformedModel {
            model: self.target,
            port_map: self.port_map,
        })
    }
}

/// Result of one or more passes: the new model plus the composed remap table
/// from the original model's outputs.
#[derive(Debug, Clone)]
pub struct TransformedModel {
    pub model: Model,
    pub port_map: PortMap,
}

impl TransformedModel {
    /// Identity transform over `model`.
    pub fn identity(model: Model) -> Result<Self> {
        let mut port_map = HashMap::new();
        for (id, node) in model.iter() {
            for index in 0..node.outputs().len() {
                port_map.insert(id.port(index), model.port_elements(id.port(index))?);
            }
        }
        Ok(TransformedModel { model, port_map })
    }

    pub fn transform_elements(&self, elements: &PortElements) -> Result<PortElements> {
        lookup(&self.port_map, elements)
    }

    /// Node now carrying output 0 of source node `old`. Fails when the output
    /// was rewritten into anything other than a whole single port.
    pub fn transform_node(&self, old: NodeId) -> Result<NodeId> {
        let port = old.port(0);
        let mapped = self
            .port_map
            .get(&port)
            .ok_or(GraphError::UnmappedReference { port })?;
        match mapped.single_range() {
            Some(range) if range.start == 0 && range.port.index == 0 => Ok(range.port.node),
            _ => Err(GraphError::MappingContract {
                port,
                reason: format!("rewritten into {}, not a single node output", mapped),
            }),
        }
    }

    /// Chain `next`, a pass over `self.model`, after this one.
    pub fn compose(self, next: TransformedModel) -> Result<TransformedModel> {
        let port_map = self
            .port_map
            .iter()
            .map(|(old, elements)| Ok((*old, next.transform_elements(elements)?)))
            .collect::<Result<PortMap>>()?;
        Ok(TransformedModel {
            model: next.model,
            port_map,
        })
    }
}

// ── Driving loops ──────────────────────────────────────────────────────────

/// Visit every node of `source` in topological order, handing each to
/// `action` with a transformer that builds the target model.
pub fn transform_model(
    source: &Model,
    mut action: impl FnMut(&Node, NodeId, &mut ModelTransformer) -> Result<()>,
) -> Result<TransformedModel> {
    let order = source.topological_order();
    let mut transformer = ModelTransformer::new();
    for &id in &order {
        action(source.get(id)?, id, &mut transformer)?;
    }
    transformer.finish(source, &order)
}

/// Copy every node unchanged into a new, independent model.
pub fn copy_model(source: &Model) -> Result<TransformedModel> {
    transform_model(source, |node, id, t| node.copy(id, t).map(|_| ()))
}

/// One Refine-or-Copy pass. Returns the result and the number of nodes that
/// decomposed.
pub fn refine_once(source: &Model) -> Result<(TransformedModel, usize)> {
    let mut refined = 0;
    let result = transform_model(source, |node, id, t| {
        if node.refine(id, t)? {
            refined += 1;
        } else {
            node.copy(id, t)?;
        }
        Ok(())
    })?;
    Ok((result, refined))
}

/// Default refinement cap for a model of `node_count` nodes.
pub fn default_refinement_cap(node_count: usize) -> usize {
    (2 * node_count).max(16)
}

/// Apply Refine-or-Copy passes until a full pass decomposes nothing.
/// Converging on the pass that hits `max_iterations` is still success; still
/// refining after it is `RefinementNonConvergence`.
pub fn refine_model(source: &Model, max_iterations: usize) -> Result<TransformedModel> {
    let started = Instant::now();
    let mut current = TransformedModel::identity(source.clone())?;
    for iteration in 1..=max_iterations {
        let (next, refined) = refine_once(&current.model)?;
        debug!(
            iteration,
            refined,
            nodes = next.model.len(),
            "refinement pass"
        );
        current = current.compose(next)?;
        if refined == 0 {
            info!(
                iterations = iteration,
                nodes = current.model.len(),
                "refinement complete, {:.1}ms",
                started.elapsed().as_secs_f64() * 1000.0
            );
            return Ok(current);
        }
    }
    Err(GraphError::RefinementNonConvergence {
        iterations: max_iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::ComputeContext;
    use crate::layout::{PortMemoryLayout, PortType};
    use crate::nodes::{ConstantNode, DenseLayerNode, InputNode, NodeKind, OutputNode};
    use crate::port::PortRange;

    fn constant_to_output() -> (Model, NodeId) {
        let mut model = Model::new();
        let c = model.add_node(ConstantNode::new(vec![1.0f64, 2.0, 3.0, 4.0])).unwrap();
        let out = model
            .add_node(OutputNode::new(model.port_elements(c.port(0)).unwrap()))
            .unwrap();
        (model, out)
    }

    fn dense_model() -> (Model, NodeId) {
        let mut model = Model::new();
        let x = model
            .add_node(InputNode::new(PortType::Real64, PortMemoryLayout::flat(2)))
            .unwrap();
        let dense = DenseLayerNode::new(
            model.port_elements(x.port(0)).unwrap(),
            2,
            2,
            vec![1.0f64, 2.0, 3.0, 4.0],
            vec![0.5f64, -0.5],
        )
        .unwrap();
        let d = model.add_node(dense).unwrap();
        let out = model
            .add_node(OutputNode::new(model.port_elements(d.port(0)).unwrap()))
            .unwrap();
        (model, out)
    }

    #[test]
    fn copy_preserves_structure_and_values() {
        let (model, out) = constant_to_output();
        let copied = copy_model(&model).unwrap();
        assert_eq!(copied.model.to_string(), model.to_string());
        let new_out = copied.transform_node(out).unwrap();
        let mut ctx = ComputeContext::new();
        for (id, node) in copied.model.iter() {
            node.compute(id, &mut ctx).unwrap();
        }
        assert_eq!(
            ctx.output(new_out.port(0)).map(|v| v.to_f64_vec()),
            Some(vec![1.0, 2.0, 3.0, 4.0])
        );
    }

    #[test]
    fn unmapped_reference_is_reported() {
        let (model, _) = constant_to_output();
        let t = ModelTransformer::new();
        let elements = model.port_elements(NodeId(0).port(0)).unwrap();
        assert_eq!(
            t.transform_port_elements(&elements).unwrap_err(),
            GraphError::UnmappedReference { port: NodeId(0).port(0) }
        );
    }

    #[test]
    fn slices_compose_through_the_table() {
        let mut model = Model::new();
        let c = model.add_node(ConstantNode::new(vec![1i32, 2, 3, 4])).unwrap();
        let copied = copy_model(&model).unwrap();
        let middle = PortElements::from_ranges(PortType::Integer, [PortRange::new(c.port(0), 1, 2)]);
        let mapped = copied.transform_elements(&middle).unwrap();
        assert_eq!(mapped.size(), 2);
        assert_eq!(mapped.ranges()[0].start, 1);
    }

    #[test]
    fn duplicate_mapping_fails_the_pass() {
        let (model, _) = constant_to_output();
        let err = transform_model(&model, |node, id, t| {
            node.copy(id, t)?;
            let again = t.target().port_elements(NodeId(0).port(0))?;
            t.map_node_output(id.port(0), again);
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, GraphError::MappingContract { .. }));
    }

    #[test]
    fn missing_mapping_fails_the_pass() {
        let (model, _) = constant_to_output();
        let err = transform_model(&model, |node, id, t| {
            if matches!(node.kind(), NodeKind::Output(_)) {
                return Ok(());
            }
            node.copy(id, t).map(|_| ())
        })
        .unwrap_err();
        assert!(matches!(err, GraphError::MappingContract { port, .. } if port == NodeId(1).port(0)));
    }

    #[test]
    fn dense_chain_reaches_fixed_point_on_third_pass() {
        let (model, out) = dense_model();
        let refined = refine_model(&model, 3).unwrap();
        assert!(refined
            .model
            .iter()
            .all(|(_, n)| !n.capabilities().refinable));
        assert!(refined.transform_node(out).is_ok());
        let (_, again) = refine_once(&refined.model).unwrap();
        assert_eq!(again, 0);
    }

    #[test]
    fn cap_reached_while_refining_is_an_error() {
        let (model, _) = dense_model();
        assert_eq!(
            refine_model(&model, 2).unwrap_err(),
            GraphError::RefinementNonConvergence { iterations: 2 }
        );
    }

    #[test]
    fn default_cap_scales_with_size() {
        assert_eq!(default_refinement_cap(3), 16);
        assert_eq!(default_refinement_cap(40), 80);
    }
}
