// compiler.rs — Map compiler: memoized, dependency-ordered kernel emission
//
// Walks a fully refined model from the map output back to its inputs and asks
// each reachable node to `compile` itself into one `FunctionEmitter`. Every
// output port is bound to exactly one buffer; later requests for the same
// port reuse it, and a node is compiled at most once per kernel.
//
// Preconditions: the model is refined (no Refinable node reachable) and its
//   layouts validate; map inputs name nodes of this model.
// Postconditions: the kernel takes one argument per map input, in order, and
//   writes the map output into its result buffer.
// Failure modes: `UnsupportedOperation` for a reachable non-compilable node;
//   errors from node `compile` propagate and abort the whole kernel.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::emitter::{BufferId, FunctionEmitter, Kernel};
use crate::error::{GraphError, Result};
use crate::id::{NodeId, PortRef};
use crate::map::MapInput;
use crate::model::Model;
use crate::node::Node;
use crate::port::PortElements;

/// Settings consulted by the compile pipeline and by nodes while emitting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapCompilerOptions {
    /// Name of the emitted kernel.
    pub function_name: String,
    /// Enables optimization passes that require it.
    pub optimize: bool,
    /// Nodes may emit parallel loops.
    pub parallelize: bool,
    /// Refinement cap; `None` picks one from the model size.
    pub max_refinement_iterations: Option<usize>,
}

impl Default for MapCompilerOptions {
    fn default() -> Self {
        MapCompilerOptions {
            function_name: "predict".to_string(),
            optimize: true,
            parallelize: true,
            max_refinement_iterations: None,
        }
    }
}

pub struct MapCompiler<'m> {
    model: &'m Model,
    options: &'m MapCompilerOptions,
    ports: HashMap<PortRef, BufferId>,
    gathered: HashMap<PortElements, BufferId>,
    compiled: HashSet<NodeId>,
}

impl<'m> MapCompiler<'m> {
    pub fn new(model: &'m Model, options: &'m MapCompilerOptions) -> Self {
        MapCompiler {
            model,
            options,
            ports: HashMap::new(),
            gathered: HashMap::new(),
            compiled: HashSet::new(),
        }
    }

    pub fn options(&self) -> &MapCompilerOptions {
        self.options
    }

    pub fn model(&self) -> &'m Model {
        self.model
    }

    /// Number of nodes compiled so far.
    pub fn compiled_count(&self) -> usize {
        self.compiled.len()
    }

    /// Record that `port`'s value lives in `buffer`.
    pub fn bind_port(&mut self, port: PortRef, buffer: BufferId) {
        self.ports.insert(port, buffer);
    }

    pub fn port_buffer(&self, port: PortRef) -> Option<BufferId> {
        self.ports.get(&port).copied()
    }

    /// Declare a scratch buffer for output `index` of `node` and bind it.
    pub fn allocate_output(
        &mut self,
        node: &Node,
        id: NodeId,
        index: usize,
        function: &mut FunctionEmitter,
    ) -> Result<BufferId> {
        let out = node.output(index).ok_or_else(|| {
            GraphError::Construction(format!("{} has no output {}", node.type_name(), index))
        })?;
        let buffer = function.declare_local(out.port_type(), out.size());
        self.bind_port(id.port(index), buffer);
        Ok(buffer)
    }

    /// Compile node `id` unless it has been compiled already.
    pub fn compile_node(&mut self, id: NodeId, function: &mut FunctionEmitter) -> Result<()> {
        if !self.compiled.insert(id) {
            return Ok(());
        }
        let model = self.model;
        let node = model.get(id)?;
        trace!(node = %id, kind = node.base_name(), "compiling");
        node.compile(id, self, function)
    }

    /// Buffer holding `port`'s value, compiling its producer on first use.
    pub fn ensure_port_emitted(&mut self, port: PortRef, function: &mut FunctionEmitter) -> Result<BufferId> {
        if let Some(buffer) = self.port_buffer(port) {
            return Ok(buffer);
        }
        self.compile_node(port.node, function)?;
        self.port_buffer(port).ok_or_else(|| {
            GraphError::Construction(format!("compiling {} did not produce a value for {}", port.node, port))
        })
    }

    /// Buffer holding exactly `elements`. A whole output port is used in
    /// place; any other selection is gathered once into a scratch buffer.
    pub fn ensure_elements_emitted(
        &mut self,
        elements: &PortElements,
        function: &mut FunctionEmitter,
    ) -> Result<BufferId> {
        if let Some(range) = elements.single_range() {
            let size = self.model.output_port(range.port)?.size();
            if range.start == 0 && range.count == size {
                return self.ensure_port_emitted(range.port, function);
            }
        }
        if let Some(&buffer) = self.gathered.get(elements) {
            return Ok(buffer);
        }
        let mut sources = Vec::with_capacity(elements.ranges().len());
        for range in elements.ranges() {
            sources.push((self.ensure_port_emitted(range.port, function)?, range.start, range.count));
        }
        let buffer = function.declare_local(elements.port_type(), elements.size());
        let mut offset = 0;
        for (src, start, count) in sources {
            function.copy(buffer, offset, src, start, count)?;
            offset += count;
        }
        self.gathered.insert(elements.clone(), buffer);
        Ok(buffer)
    }
}

/// Emit one kernel computing `output` from `inputs` over `model`.
pub fn compile_model(
    model: &Model,
    inputs: &[MapInput],
    output: &PortElements,
    options: &MapCompilerOptions,
) -> Result<Kernel> {
    let mut function = FunctionEmitter::new(options.function_name.as_str());
    let mut compiler = MapCompiler::new(model, options);
    for input in inputs {
        let port = input.node.port(0);
        let out = model.output_port(port)?;
        let buffer = function.declare_argument(&input.name, out.port_type(), out.size());
        compiler.bind_port(port, buffer);
        compiler.compiled.insert(input.node);
    }
    let result = function.declare_result("output", output.port_type(), output.size());

    let roots: Vec<NodeId> = output.referenced_nodes().collect();
    for id in model.reachable_from(&roots)? {
        compiler.compile_node(id, &mut function)?;
    }

    let mut offset = 0;
    for range in output.ranges() {
        let src = compiler.ensure_port_emitted(range.port, &mut function)?;
        function.copy(result, offset, src, range.start, range.count)?;
        offset += range.count;
    }
    let kernel = function.finish();
    debug!(
        function = kernel.name(),
        nodes = compiler.compiled_count(),
        buffers = kernel.buffers().len(),
        "kernel emitted"
    );
    Ok(kernel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::{BinaryOp, BufferKind};
    use crate::layout::{PortMemoryLayout, PortType};
    use crate::nodes::{BinaryOperationNode, ConstantNode, InputNode, OutputNode};
    use crate::port::PortRange;
    use crate::value::PortValue;

    fn input(name: &str, node: NodeId) -> MapInput {
        MapInput {
            name: name.to_string(),
            node,
        }
    }

    #[test]
    fn shared_constant_is_declared_once() {
        let mut model = Model::new();
        let x = model
            .add_node(InputNode::new(PortType::Real32, PortMemoryLayout::flat(3)))
            .unwrap();
        let c = model.add_node(ConstantNode::new(vec![1.0f32, 2.0, 3.0])).unwrap();
        let ex = model.port_elements(x.port(0)).unwrap();
        let ec = model.port_elements(c.port(0)).unwrap();
        let a = model
            .add_node(BinaryOperationNode::new(BinaryOp::Add, ex.clone(), ec.clone()).unwrap())
            .unwrap();
        let m = model
            .add_node(BinaryOperationNode::new(BinaryOp::Multiply, ex, ec).unwrap())
            .unwrap();
        let ea = model.port_elements(a.port(0)).unwrap();
        let em = model.port_elements(m.port(0)).unwrap();
        let s = model
            .add_node(BinaryOperationNode::new(BinaryOp::Subtract, ea, em).unwrap())
            .unwrap();
        let out = model.port_elements(s.port(0)).unwrap();

        let options = MapCompilerOptions::default();
        let kernel = compile_model(&model, &[input("x", x)], &out, &options).unwrap();
        let constants = kernel
            .buffers()
            .iter()
            .filter(|b| matches!(b.kind, BufferKind::Constant(_)))
            .count();
        assert_eq!(constants, 1);
        // (x + c) - (x * c) with x = [1, 1, 1]
        let y = kernel.execute(&[PortValue::from(vec![1.0f32, 1.0, 1.0])]).unwrap();
        assert_eq!(y, PortValue::from(vec![1.0f32, 1.0, 1.0]));
    }

    #[test]
    fn gathered_selection_is_reused() {
        let mut model = Model::new();
        let x = model
            .add_node(InputNode::new(PortType::Real64, PortMemoryLayout::flat(4)))
            .unwrap();
        let tail = PortElements::from_ranges(PortType::Real64, [PortRange::new(x.port(0), 2, 2)]);
        let a = model
            .add_node(BinaryOperationNode::new(BinaryOp::Add, tail.clone(), tail.clone()).unwrap())
            .unwrap();
        let out = model
            .add_node(OutputNode::new(model.port_elements(a.port(0)).unwrap()))
            .unwrap();
        let options = MapCompilerOptions::default();
        let kernel = compile_model(
            &model,
            &[input("x", x)],
            &model.port_elements(out.port(0)).unwrap(),
            &options,
        )
        .unwrap();
        // one gathered slice plus the add result
        assert_eq!(kernel.local_count(), 2);
        let y = kernel
            .execute(&[PortValue::from(vec![1.0f64, 2.0, 3.0, 4.0])])
            .unwrap();
        assert_eq!(y, PortValue::from(vec![6.0f64, 8.0]));
    }

    #[test]
    fn undeclared_input_aborts_compilation() {
        let mut model = Model::new();
        let x = model
            .add_node(InputNode::new(PortType::Real32, PortMemoryLayout::flat(2)))
            .unwrap();
        let out = model.port_elements(x.port(0)).unwrap();
        let options = MapCompilerOptions::default();
        let err = compile_model(&model, &[], &out, &options).unwrap_err();
        assert!(matches!(err, GraphError::InvalidArgument(_)));
    }
}
