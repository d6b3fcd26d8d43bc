// node.rs — Graph vertex: ports, capabilities and capability-gated operations
//
// A `Node` owns its input and output ports and one `NodeKind` variant from the
// closed node set. Kind-specific behavior sits behind the crate-internal
// `NodeOps` trait; `Node` adds the capability checks and the generic Copy path.
//
// Preconditions: input PortElements reference outputs that exist in the model
//   the node is inserted into (checked by `Model::add_node`).
// Postconditions: output ports and layouts never change after construction.
// Failure modes: `UnsupportedOperation` when a capability is missing.

use std::fmt;

use crate::archive::{Archiver, Unarchiver};
use crate::compiler::MapCompiler;
use crate::compute::ComputeContext;
use crate::emitter::FunctionEmitter;
use crate::error::{GraphError, Result};
use crate::id::NodeId;
use crate::layout::{DimensionOrder, PortMemoryLayout, PortType};
use crate::nodes::{self, NodeKind};
use crate::port::{InputPort, OutputPort, PortElements, PortRange};
use crate::transformer::ModelTransformer;

/// Capability set, fixed per node kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub has_state: bool,
    pub computable: bool,
    pub compilable: bool,
    pub refinable: bool,
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.has_state {
            names.push("state");
        }
        if self.computable {
            names.push("compute");
        }
        if self.compilable {
            names.push("compile");
        }
        if self.refinable {
            names.push("refine");
        }
        write!(f, "{}", names.join("|"))
    }
}

/// Kind-specific behavior. Defaults describe a kind without the capability.
pub(crate) trait NodeOps {
    fn base_name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    fn archive_version(&self) -> u32 {
        1
    }

    /// Declared input layouts, by input index, that producers must match.
    fn input_layouts(&self) -> Vec<(usize, &PortMemoryLayout)> {
        Vec::new()
    }

    fn compute(&self, node: &Node, _id: NodeId, _ctx: &mut ComputeContext) -> Result<()> {
        Err(GraphError::unsupported(node.type_name(), "compute"))
    }

    fn compile(
        &self,
        node: &Node,
        _id: NodeId,
        _compiler: &mut MapCompiler<'_>,
        _function: &mut FunctionEmitter,
    ) -> Result<()> {
        Err(GraphError::unsupported(node.type_name(), "compile"))
    }

    fn refine(&self, _node: &Node, _id: NodeId, _transformer: &mut ModelTransformer) -> Result<bool> {
        Ok(false)
    }

    fn write_state(&self, _node: &Node, _archiver: &mut dyn Archiver) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    kind: NodeKind,
    inputs: Vec<InputPort>,
    outputs: Vec<OutputPort>,
}

impl Node {
    pub(crate) fn from_parts(kind: NodeKind, inputs: Vec<InputPort>, outputs: Vec<OutputPort>) -> Self {
        Node {
            kind,
            inputs,
            outputs,
        }
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[InputPort] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputPort] {
        &self.outputs
    }

    pub fn input(&self, index: usize) -> Option<&InputPort> {
        self.inputs.get(index)
    }

    pub fn output(&self, index: usize) -> Option<&OutputPort> {
        self.outputs.get(index)
    }

    pub fn base_name(&self) -> &'static str {
        self.kind.ops().base_name()
    }

    /// Kind name with its element type, e.g. `ConstantNode<real32>`.
    pub fn type_name(&self) -> String {
        let element = self
            .outputs
            .first()
            .map(OutputPort::port_type)
            .or_else(|| self.inputs.first().map(InputPort::port_type));
        match element {
            Some(t) => format!("{}<{}>", self.base_name(), t),
            None => self.base_name().to_string(),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.kind.ops().capabilities()
    }

    /// Whole-port selection of this node's output `index`.
    pub fn output_elements(&self, id: NodeId, index: usize) -> Option<PortElements> {
        self.outputs.get(index).map(|out| {
            PortElements::from_ranges(
                out.port_type(),
                [PortRange::new(id.port(index), 0, out.size())],
            )
        })
    }

    pub(crate) fn input_layouts(&self) -> Vec<(usize, &PortMemoryLayout)> {
        self.kind.ops().input_layouts()
    }

    // ── Layout negotiation ──────────────────────────────────────────────

    /// Output layouts are fixed; this only succeeds when output `index`
    /// already has logical order `order`.
    pub fn try_set_output_layout(&self, index: usize, order: &DimensionOrder) -> bool {
        self.outputs
            .get(index)
            .map_or(false, |out| out.layout().logical_dimension_order() == order)
    }

    /// Whether a producer with logical order `order` can feed this node
    /// without an adapter.
    pub fn can_accept_input_layout(&self, order: &DimensionOrder) -> bool {
        self.input_layouts()
            .iter()
            .all(|(_, layout)| layout.logical_dimension_order() == order)
    }

    // ── Capability-gated operations ─────────────────────────────────────

    pub fn compute(&self, id: NodeId, ctx: &mut ComputeContext) -> Result<()> {
        if !self.capabilities().computable {
            return Err(GraphError::unsupported(self.type_name(), "compute"));
        }
        self.kind.ops().compute(self, id, ctx)
    }

    pub fn compile(
        &self,
        id: NodeId,
        compiler: &mut MapCompiler<'_>,
        function: &mut FunctionEmitter,
    ) -> Result<()> {
        if !self.capabilities().compilable {
            return Err(GraphError::unsupported(self.type_name(), "compile"));
        }
        self.kind.ops().compile(self, id, compiler, function)
    }

    /// Decompose into simpler nodes in the transformer's target model.
    /// `Ok(false)` means nothing was added and the caller should `copy`.
    pub fn refine(&self, id: NodeId, transformer: &mut ModelTransformer) -> Result<bool> {
        if !self.capabilities().refinable {
            return Ok(false);
        }
        self.kind.ops().refine(self, id, transformer)
    }

    /// Add an equivalent node to the target model and map every output to it.
    pub fn copy(&self, id: NodeId, transformer: &mut ModelTransformer) -> Result<NodeId> {
        let inputs = self
            .inputs
            .iter()
            .map(|input| transformer.transform_port_elements(input.elements()))
            .collect::<Result<Vec<_>>>()?;
        let new_node = self.with_inputs(inputs)?;
        let new_id = transformer.add_node(new_node)?;
        for index in 0..self.outputs.len() {
            let elements = transformer.target().port_elements(new_id.port(index))?;
            transformer.map_node_output(id.port(index), elements);
        }
        Ok(new_id)
    }

    /// Same node bound to different inputs of identical type and size.
    pub fn with_inputs(&self, inputs: Vec<PortElements>) -> Result<Node> {
        if inputs.len() != self.inputs.len() {
            return Err(GraphError::Construction(format!(
                "{} takes {} inputs, got {}",
                self.type_name(),
                self.inputs.len(),
                inputs.len()
            )));
        }
        let mut node = self.clone();
        for (port, elements) in node.inputs.iter_mut().zip(inputs) {
            if elements.port_type() != port.port_type() || elements.size() != port.size() {
                return Err(GraphError::Construction(format!(
                    "input '{}' expects {} {} elements, got {} {} elements",
                    port.name(),
                    port.size(),
                    port.port_type(),
                    elements.size(),
                    elements.port_type()
                )));
            }
            port.rebind(elements);
        }
        Ok(node)
    }

    // ── Archiving ───────────────────────────────────────────────────────

    pub fn archive_version(&self) -> u32 {
        self.kind.ops().archive_version()
    }

    pub fn can_read_archive_version(&self, version: u32) -> bool {
        (1..=self.archive_version()).contains(&version)
    }

    /// Persist state fields only; connectivity is archived by the model.
    pub fn write_to_archive(&self, archiver: &mut dyn Archiver) -> Result<()> {
        self.kind.ops().write_state(self, archiver)
    }

    /// Rebuild a node of `type_name` from its archived state, bound to
    /// already-remapped `inputs`.
    pub fn read_from_archive(
        type_name: &str,
        version: u32,
        inputs: Vec<PortElements>,
        unarchiver: &dyn Unarchiver,
    ) -> Result<Node> {
        let base = type_name.split('<').next().unwrap_or(type_name);
        let info = nodes::kind_info(base)
            .ok_or_else(|| GraphError::Archive(format!("unknown node type '{}'", type_name)))?;
        if !(1..=info.archive_version).contains(&version) {
            return Err(GraphError::ArchiveVersion {
                node_type: type_name.to_string(),
                found: version,
                current: info.archive_version,
            });
        }
        (info.read)(version, inputs, unarchiver)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.type_name())?;
        for (i, input) in self.inputs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", input.elements())?;
        }
        write!(f, ")")?;
        for (i, out) in self.outputs.iter().enumerate() {
            let sep = if i == 0 { " -> " } else { ", " };
            write!(f, "{}{}: {}[{}]", sep, out.name(), out.port_type(), out.size())?;
        }
        Ok(())
    }
}

// ── Construction helpers shared by node kinds ──────────────────────────────

pub(crate) fn output(name: &str, port_type: PortType, layout: PortMemoryLayout) -> OutputPort {
    OutputPort::new(name, port_type, layout)
}

pub(crate) fn input(name: &str, elements: PortElements) -> InputPort {
    InputPort::new(name, elements)
}

/// Destructure archived inputs into exactly `N` bindings.
pub(crate) fn take_inputs<const N: usize>(
    kind: &str,
    inputs: Vec<PortElements>,
) -> Result<[PortElements; N]> {
    let found = inputs.len();
    inputs.try_into().map_err(|_| {
        GraphError::Archive(format!("{} expects {} inputs, archive has {}", kind, N, found))
    })
}

pub(crate) fn require_size(what: &str, elements: &PortElements, expected: usize) -> Result<()> {
    if elements.size() != expected {
        return Err(GraphError::Construction(format!(
            "{} has {} elements, expected {}",
            what,
            elements.size(),
            expected
        )));
    }
    Ok(())
}
