// io.rs — Boundary nodes: inputs, constants, outputs, sources and sinks

use crate::archive::{Archiver, Unarchiver};
use crate::compiler::MapCompiler;
use crate::compute::ComputeContext;
use crate::emitter::FunctionEmitter;
use crate::error::{GraphError, Result};
use crate::id::NodeId;
use crate::layout::{PortMemoryLayout, PortType};
use crate::node::{input, output, require_size, take_inputs, Capabilities, Node, NodeOps};
use crate::nodes::NodeKind;
use crate::port::{OutputPort, PortElements};
use crate::value::PortValue;

fn first_output(node: &Node) -> Result<&OutputPort> {
    node.output(0)
        .ok_or_else(|| GraphError::Construction(format!("{} has no output port", node.base_name())))
}

fn first_input(node: &Node) -> Result<&PortElements> {
    node.input(0)
        .map(|i| i.elements())
        .ok_or_else(|| GraphError::Construction(format!("{} has no input port", node.base_name())))
}

// ── InputNode ──────────────────────────────────────────────────────────────

/// Caller-supplied buffer. Values are bound by the map, never computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputNode;

impl InputNode {
    pub const ARCHIVE_VERSION: u32 = 1;

    #[allow(clippy::new_ret_no_self)]
    pub fn new(port_type: PortType, layout: PortMemoryLayout) -> Node {
        Node::from_parts(
            NodeKind::Input(InputNode),
            Vec::new(),
            vec![output("output", port_type, layout)],
        )
    }

    pub(crate) fn read_state(_version: u32, inputs: Vec<PortElements>, ar: &dyn Unarchiver) -> Result<Node> {
        take_inputs::<0>("InputNode", inputs)?;
        Ok(InputNode::new(ar.read("port_type")?, ar.read("layout")?))
    }
}

impl NodeOps for InputNode {
    fn base_name(&self) -> &'static str {
        "InputNode"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            computable: true,
            compilable: true,
            ..Capabilities::default()
        }
    }

    fn compute(&self, _node: &Node, id: NodeId, ctx: &mut ComputeContext) -> Result<()> {
        match ctx.output(id.port(0)) {
            Some(_) => Ok(()),
            None => Err(GraphError::MissingValue { port: id.port(0) }),
        }
    }

    fn compile(
        &self,
        _node: &Node,
        id: NodeId,
        _compiler: &mut MapCompiler<'_>,
        _function: &mut FunctionEmitter,
    ) -> Result<()> {
        // map inputs are bound before the walk starts
        Err(GraphError::InvalidArgument(format!(
            "{} is not a declared input of the map",
            id
        )))
    }

    fn write_state(&self, node: &Node, ar: &mut dyn Archiver) -> Result<()> {
        let out = first_output(node)?;
        ar.write("port_type", &out.port_type())?;
        ar.write("layout", out.layout())
    }
}

// ── ConstantNode ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ConstantNode {
    values: PortValue,
}

impl ConstantNode {
    pub const ARCHIVE_VERSION: u32 = 1;

    /// Constant with a flat layout of `values.len()` elements.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(values: impl Into<PortValue>) -> Node {
        let values = values.into();
        let layout = PortMemoryLayout::flat(values.len());
        Self::build(values, layout)
    }

    /// Constant whose buffer has an explicit layout (padding included).
    pub fn with_layout(values: impl Into<PortValue>, layout: PortMemoryLayout) -> Result<Node> {
        let values = values.into();
        if values.len() != layout.memory_size() {
            return Err(GraphError::Construction(format!(
                "constant has {} values but layout {} holds {}",
                values.len(),
                layout,
                layout.memory_size()
            )));
        }
        Ok(Self::build(values, layout))
    }

    fn build(values: PortValue, layout: PortMemoryLayout) -> Node {
        let port_type = values.port_type();
        Node::from_parts(
            NodeKind::Constant(ConstantNode { values }),
            Vec::new(),
            vec![output("output", port_type, layout)],
        )
    }

    pub fn values(&self) -> &PortValue {
        &self.values
    }

    pub(crate) fn read_state(_version: u32, inputs: Vec<PortElements>, ar: &dyn Unarchiver) -> Result<Node> {
        take_inputs::<0>("ConstantNode", inputs)?;
        ConstantNode::with_layout(ar.read::<PortValue>("values")?, ar.read("layout")?)
    }
}

impl NodeOps for ConstantNode {
    fn base_name(&self) -> &'static str {
        "ConstantNode"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_state: true,
            computable: true,
            compilable: true,
            refinable: false,
        }
    }

    fn compute(&self, _node: &Node, id: NodeId, ctx: &mut ComputeContext) -> Result<()> {
        ctx.set_output(id.port(0), self.values.clone());
        Ok(())
    }

    fn compile(
        &self,
        _node: &Node,
        id: NodeId,
        compiler: &mut MapCompiler<'_>,
        function: &mut FunctionEmitter,
    ) -> Result<()> {
        let buffer = function.declare_constant(self.values.port_type(), self.values.to_f64_vec());
        compiler.bind_port(id.port(0), buffer);
        Ok(())
    }

    fn write_state(&self, node: &Node, ar: &mut dyn Archiver) -> Result<()> {
        ar.write("values", &self.values)?;
        ar.write("layout", first_output(node)?.layout())
    }
}

// ── OutputNode ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputNode;

impl OutputNode {
    pub const ARCHIVE_VERSION: u32 = 1;

    #[allow(clippy::new_ret_no_self)]
    pub fn new(input_elements: PortElements) -> Node {
        let layout = PortMemoryLayout::flat(input_elements.size());
        Self::build(input_elements, layout)
    }

    pub fn with_layout(input_elements: PortElements, layout: PortMemoryLayout) -> Result<Node> {
        require_size("output input", &input_elements, layout.memory_size())?;
        Ok(Self::build(input_elements, layout))
    }

    fn build(input_elements: PortElements, layout: PortMemoryLayout) -> Node {
        let port_type = input_elements.port_type();
        Node::from_parts(
            NodeKind::Output(OutputNode),
            vec![input("input", input_elements)],
            vec![output("output", port_type, layout)],
        )
    }

    pub(crate) fn read_state(_version: u32, inputs: Vec<PortElements>, ar: &dyn Unarchiver) -> Result<Node> {
        let [elements] = take_inputs::<1>("OutputNode", inputs)?;
        OutputNode::with_layout(elements, ar.read("layout")?)
    }
}

impl NodeOps for OutputNode {
    fn base_name(&self) -> &'static str {
        "OutputNode"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            computable: true,
            compilable: true,
            ..Capabilities::default()
        }
    }

    fn compute(&self, node: &Node, id: NodeId, ctx: &mut ComputeContext) -> Result<()> {
        let value = ctx.gather_value(first_input(node)?)?;
        ctx.set_output(id.port(0), value);
        Ok(())
    }

    fn compile(
        &self,
        node: &Node,
        id: NodeId,
        compiler: &mut MapCompiler<'_>,
        function: &mut FunctionEmitter,
    ) -> Result<()> {
        let buffer = compiler.ensure_elements_emitted(first_input(node)?, function)?;
        compiler.bind_port(id.port(0), buffer);
        Ok(())
    }

    fn write_state(&self, node: &Node, ar: &mut dyn Archiver) -> Result<()> {
        ar.write("layout", first_output(node)?.layout())
    }
}

// ── SourceNode ─────────────────────────────────────────────────────────────

/// Callback-driven input. Replaced by an InputNode before compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceNode {
    callback: String,
}

impl SourceNode {
    pub const ARCHIVE_VERSION: u32 = 1;

    #[allow(clippy::new_ret_no_self)]
    pub fn new(callback: impl Into<String>, port_type: PortType, layout: PortMemoryLayout) -> Node {
        Node::from_parts(
            NodeKind::Source(SourceNode {
                callback: callback.into(),
            }),
            Vec::new(),
            vec![output("output", port_type, layout)],
        )
    }

    pub fn callback(&self) -> &str {
        &self.callback
    }

    pub(crate) fn read_state(_version: u32, inputs: Vec<PortElements>, ar: &dyn Unarchiver) -> Result<Node> {
        take_inputs::<0>("SourceNode", inputs)?;
        Ok(SourceNode::new(
            ar.read::<String>("callback")?,
            ar.read("port_type")?,
            ar.read("layout")?,
        ))
    }
}

impl NodeOps for SourceNode {
    fn base_name(&self) -> &'static str {
        "SourceNode"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_state: true,
            ..Capabilities::default()
        }
    }

    fn write_state(&self, node: &Node, ar: &mut dyn Archiver) -> Result<()> {
        let out = first_output(node)?;
        ar.write("callback", &self.callback)?;
        ar.write("port_type", &out.port_type())?;
        ar.write("layout", out.layout())
    }
}

// ── SinkNode ───────────────────────────────────────────────────────────────

/// Callback-driven output. Passes its input through when computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkNode {
    callback: String,
}

impl SinkNode {
    pub const ARCHIVE_VERSION: u32 = 1;

    #[allow(clippy::new_ret_no_self)]
    pub fn new(input_elements: PortElements, callback: impl Into<String>) -> Node {
        let port_type = input_elements.port_type();
        let layout = PortMemoryLayout::flat(input_elements.size());
        Node::from_parts(
            NodeKind::Sink(SinkNode {
                callback: callback.into(),
            }),
            vec![input("input", input_elements)],
            vec![output("output", port_type, layout)],
        )
    }

    pub fn callback(&self) -> &str {
        &self.callback
    }

    pub(crate) fn read_state(_version: u32, inputs: Vec<PortElements>, ar: &dyn Unarchiver) -> Result<Node> {
        let [elements] = take_inputs::<1>("SinkNode", inputs)?;
        Ok(SinkNode::new(elements, ar.read::<String>("callback")?))
    }
}

impl NodeOps for SinkNode {
    fn base_name(&self) -> &'static str {
        "SinkNode"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_state: true,
            computable: true,
            ..Capabilities::default()
        }
    }

    fn compute(&self, node: &Node, id: NodeId, ctx: &mut ComputeContext) -> Result<()> {
        let value = ctx.gather_value(first_input(node)?)?;
        ctx.set_output(id.port(0), value);
        Ok(())
    }

    fn write_state(&self, _node: &Node, ar: &mut dyn Archiver) -> Result<()> {
        ar.write("callback", &self.callback)
    }
}
