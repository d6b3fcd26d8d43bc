// map.rs — Callable packaging of a model: named inputs, one output
//
// A `Map` owns its model, names the nodes that receive caller buffers and
// selects the output elements. Every rewrite (refine, optimize) produces a new
// map whose inputs and output are carried through the transformer's remap
// table, so callers keep addressing the same logical boundary.
//
// Preconditions: input nodes are `InputNode`s or `SourceNode`s of the model;
//   input names are unique and non-empty.
// Postconditions: `compute` and a compiled map agree on call contract: one
//   flat buffer per input in declaration order, one flat output buffer.
// Failure modes: `Construction` for a malformed map, `InvalidArgument` for a
//   call with the wrong buffers, plus whatever evaluation reports.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::compiled::CompiledMap;
use crate::compiler::MapCompilerOptions;
use crate::compute::ComputeContext;
use crate::error::{GraphError, Result};
use crate::id::NodeId;
use crate::layout::{PortMemoryLayout, PortType};
use crate::model::Model;
use crate::nodes::NodeKind;
use crate::pass::{ModelOptimizer, PassRegistry};
use crate::pipeline::{run_pipeline, CompilationState, Stage};
use crate::port::{OutputPort, PortElements};
use crate::transformer::{default_refinement_cap, refine_model, TransformedModel};
use crate::value::PortValue;

/// One named map input and the node that receives it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapInput {
    pub name: String,
    pub node: NodeId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Map {
    model: Model,
    inputs: Vec<MapInput>,
    output: PortElements,
}

impl Map {
    pub fn new(
        model: Model,
        inputs: impl IntoIterator<Item = (String, NodeId)>,
        output: PortElements,
    ) -> Result<Map> {
        let inputs: Vec<MapInput> = inputs
            .into_iter()
            .map(|(name, node)| MapInput { name, node })
            .collect();
        for (i, input) in inputs.iter().enumerate() {
            if input.name.is_empty() {
                return Err(GraphError::Construction(format!("map input {} has no name", input.node)));
            }
            if inputs[..i].iter().any(|other| other.name == input.name) {
                return Err(GraphError::Construction(format!(
                    "map input name '{}' is used twice",
                    input.name
                )));
            }
            if let Some(other) = inputs[..i].iter().find(|other| other.node == input.node) {
                return Err(GraphError::Construction(format!(
                    "{} is bound to both map inputs '{}' and '{}'",
                    input.node, other.name, input.name
                )));
            }
            match model.get(input.node)?.kind() {
                NodeKind::Input(_) | NodeKind::Source(_) => {}
                _ => {
                    return Err(GraphError::Construction(format!(
                        "map input '{}' names {}, which is not an input node",
                        input.name,
                        model.get(input.node)?.type_name()
                    )))
                }
            }
        }
        for range in output.ranges() {
            let out = model.output_port(range.port)?;
            if out.port_type() != output.port_type() || range.end() > out.size() {
                return Err(GraphError::Construction(format!(
                    "map output range {} does not fit {} {}[{}]",
                    range,
                    range.port,
                    out.port_type(),
                    out.size()
                )));
            }
        }
        Ok(Map {
            model,
            inputs,
            output,
        })
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn inputs(&self) -> &[MapInput] {
        &self.inputs
    }

    pub fn output(&self) -> &PortElements {
        &self.output
    }

    pub fn output_type(&self) -> PortType {
        self.output.port_type()
    }

    pub fn output_size(&self) -> usize {
        self.output.size()
    }

    fn input_port(&self, index: usize) -> Result<&OutputPort> {
        let input = self
            .inputs
            .get(index)
            .ok_or_else(|| GraphError::InvalidArgument(format!("map has no input {}", index)))?;
        self.model.output_port(input.node.port(0))
    }

    pub fn input_type(&self, index: usize) -> Result<PortType> {
        Ok(self.input_port(index)?.port_type())
    }

    pub fn input_layout(&self, index: usize) -> Result<&PortMemoryLayout> {
        Ok(self.input_port(index)?.layout())
    }

    fn check_arguments(&self, values: &[PortValue]) -> Result<()> {
        if values.len() != self.inputs.len() {
            return Err(GraphError::InvalidArgument(format!(
                "map expects {} input buffers, got {}",
                self.inputs.len(),
                values.len()
            )));
        }
        for (index, (input, value)) in self.inputs.iter().zip(values).enumerate() {
            let port = self.input_port(index)?;
            if value.port_type() != port.port_type() || value.len() != port.size() {
                return Err(GraphError::InvalidArgument(format!(
                    "input '{}' expects {} {} elements, got {} {} elements",
                    input.name,
                    port.size(),
                    port.port_type(),
                    value.len(),
                    value.port_type()
                )));
            }
        }
        Ok(())
    }

    /// Interpreted evaluation: bind `values` to the inputs, then compute every
    /// node the output depends on in topological order.
    pub fn compute(&self, values: &[PortValue]) -> Result<PortValue> {
        self.check_arguments(values)?;
        self.model.validate_layouts()?;
        let mut ctx = ComputeContext::new();
        for (input, value) in self.inputs.iter().zip(values) {
            ctx.set_output(input.node.port(0), value.clone());
        }
        let roots: Vec<NodeId> = self.output.referenced_nodes().collect();
        self.model.visit(&roots, |id, node| {
            if self.inputs.iter().any(|i| i.node == id) {
                return Ok(());
            }
            node.compute(id, &mut ctx)
        })?;
        ctx.gather_value(&self.output)
    }

    /// Same boundary over a rewritten model.
    pub fn transformed(&self, t: TransformedModel) -> Result<Map> {
        let inputs = self
            .inputs
            .iter()
            .map(|i| Ok((i.name.clone(), t.transform_node(i.node)?)))
            .collect::<Result<Vec<_>>>()?;
        let output = t.transform_elements(&self.output)?;
        Map::new(t.model, inputs, output)
    }

    /// Refine to a fixed point. `max_iterations` defaults to the size-based cap.
    pub fn refine(&self, max_iterations: Option<usize>) -> Result<Map> {
        let cap = max_iterations.unwrap_or_else(|| default_refinement_cap(self.model.len()));
        let refined = refine_model(&self.model, cap)?;
        debug!(
            before = self.model.len(),
            after = refined.model.len(),
            cap,
            "map refined"
        );
        self.transformed(refined)
    }

    /// Run every registered pass selected by `options`, in registry order.
    pub fn optimize(&self, registry: &PassRegistry, options: &MapCompilerOptions) -> Result<Map> {
        // folding evaluates constants, so a mismatch must surface before it
        self.model.validate_layouts()?;
        let optimizer = ModelOptimizer::new(registry, options);
        self.transformed(optimizer.optimize(&self.model, options)?)
    }

    /// Refine, optimize, validate layouts and emit with the standard passes.
    pub fn compile(&self, options: &MapCompilerOptions) -> Result<CompiledMap> {
        self.compile_with(&PassRegistry::standard(), options)
    }

    pub fn compile_with(&self, registry: &PassRegistry, options: &MapCompilerOptions) -> Result<CompiledMap> {
        let mut state = CompilationState::new(self.clone());
        run_pipeline(&mut state, Stage::Emit, options, registry)?;
        CompiledMap::from_state(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::BinaryOp;
    use crate::nodes::{BinaryOperationNode, ConstantNode, InputNode};

    fn adder() -> Map {
        let mut model = Model::new();
        let a = model
            .add_node(InputNode::new(PortType::Real32, PortMemoryLayout::flat(3)))
            .unwrap();
        let b = model
            .add_node(InputNode::new(PortType::Real32, PortMemoryLayout::flat(3)))
            .unwrap();
        let ea = model.port_elements(a.port(0)).unwrap();
        let eb = model.port_elements(b.port(0)).unwrap();
        let sum = model
            .add_node(BinaryOperationNode::new(BinaryOp::Add, ea, eb).unwrap())
            .unwrap();
        let out = model.port_elements(sum.port(0)).unwrap();
        Map::new(model, [("a".to_string(), a), ("b".to_string(), b)], out).unwrap()
    }

    #[test]
    fn compute_binds_inputs_in_order() {
        let map = adder();
        let y = map
            .compute(&[
                PortValue::from(vec![1.0f32, 2.0, 3.0]),
                PortValue::from(vec![10.0f32, 20.0, 30.0]),
            ])
            .unwrap();
        assert_eq!(y, PortValue::from(vec![11.0f32, 22.0, 33.0]));
    }

    #[test]
    fn wrong_buffers_are_rejected() {
        let map = adder();
        let short = map.compute(&[PortValue::from(vec![1.0f32, 2.0, 3.0])]);
        assert!(matches!(short, Err(GraphError::InvalidArgument(_))));
        let mistyped = map.compute(&[
            PortValue::from(vec![1.0f64, 2.0, 3.0]),
            PortValue::from(vec![1.0f32, 2.0, 3.0]),
        ]);
        assert!(matches!(mistyped, Err(GraphError::InvalidArgument(_))));
    }

    #[test]
    fn constant_cannot_be_an_input() {
        let mut model = Model::new();
        let c = model.add_node(ConstantNode::new(vec![1.0f32])).unwrap();
        let out = model.port_elements(c.port(0)).unwrap();
        let err = Map::new(model, [("c".to_string(), c)], out).unwrap_err();
        assert!(matches!(err, GraphError::Construction(_)));
    }

    #[test]
    fn duplicate_input_names_are_rejected() {
        let mut model = Model::new();
        let a = model
            .add_node(InputNode::new(PortType::Real32, PortMemoryLayout::flat(1)))
            .unwrap();
        let out = model.port_elements(a.port(0)).unwrap();
        let err = Map::new(model, [("x".to_string(), a), ("x".to_string(), a)], out).unwrap_err();
        assert!(matches!(err, GraphError::Construction(_)));
    }

    #[test]
    fn one_node_cannot_back_two_inputs() {
        let mut model = Model::new();
        let a = model
            .add_node(InputNode::new(PortType::Real32, PortMemoryLayout::flat(1)))
            .unwrap();
        let out = model.port_elements(a.port(0)).unwrap();
        let err = Map::new(model, [("x".to_string(), a), ("y".to_string(), a)], out).unwrap_err();
        match err {
            GraphError::Construction(message) => assert!(message.contains("'x' and 'y'"), "{}", message),
            other => panic!("expected a construction error, got {:?}", other),
        }
    }
}
