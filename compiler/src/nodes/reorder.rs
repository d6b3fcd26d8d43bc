// reorder.rs — Explicit layout adapter
//
// Copies the active region of `input_layout` into `output_layout`, permuting
// physical dimensions so that logical dimensions line up and filling output
// padding with `padding`. This is the only way a layout changes in a model.

use crate::archive::{Archiver, Unarchiver};
use crate::compiler::MapCompiler;
use crate::compute::ComputeContext;
use crate::emitter::{Expr, FunctionEmitter};
use crate::error::{GraphError, Result};
use crate::id::NodeId;
use crate::layout::{for_each_coordinate, PortMemoryLayout};
use crate::node::{input, output, require_size, take_inputs, Capabilities, Node, NodeOps};
use crate::nodes::NodeKind;
use crate::port::PortElements;

#[derive(Debug, Clone, PartialEq)]
pub struct ReorderDataNode {
    input_layout: PortMemoryLayout,
    output_layout: PortMemoryLayout,
    padding: f64,
}

impl ReorderDataNode {
    pub const ARCHIVE_VERSION: u32 = 1;

    #[allow(clippy::new_ret_no_self)]
    pub fn new(
        input_elements: PortElements,
        input_layout: PortMemoryLayout,
        output_layout: PortMemoryLayout,
        padding: f64,
    ) -> Result<Node> {
        require_size("reorder input", &input_elements, input_layout.memory_size())?;
        if !input_layout.same_logical_extent(&output_layout) {
            return Err(GraphError::Construction(format!(
                "cannot reorder {} into {}: logical extents differ",
                input_layout, output_layout
            )));
        }
        let port_type = input_elements.port_type();
        Ok(Node::from_parts(
            NodeKind::ReorderData(ReorderDataNode {
                output_layout: output_layout.clone(),
                input_layout,
                padding,
            }),
            vec![input("input", input_elements)],
            vec![output("output", port_type, output_layout)],
        ))
    }

    pub fn input_layout(&self) -> &PortMemoryLayout {
        &self.input_layout
    }

    pub fn output_layout(&self) -> &PortMemoryLayout {
        &self.output_layout
    }

    /// True when the node can be dropped: identical layouts and no padding
    /// region, since a reorder also rewrites padding to `padding`.
    pub fn is_identity(&self) -> bool {
        self.input_layout == self.output_layout && !self.output_layout.has_padding()
    }

    /// For each input physical dimension, the output physical dimension that
    /// carries the same logical dimension.
    fn source_dims(&self) -> Result<Vec<usize>> {
        let out_order = self.output_layout.logical_dimension_order();
        self.input_layout
            .logical_dimension_order()
            .dims()
            .iter()
            .map(|&logical| {
                out_order.physical_index(logical).ok_or_else(|| {
                    GraphError::Construction(format!(
                        "logical dimension {} missing from output order {}",
                        logical, out_order
                    ))
                })
            })
            .collect()
    }

    fn input_of(node: &Node) -> Result<&PortElements> {
        node.input(0)
            .map(|i| i.elements())
            .ok_or_else(|| GraphError::Construction("ReorderDataNode has no input".into()))
    }

    pub(crate) fn read_state(_version: u32, inputs: Vec<PortElements>, ar: &dyn Unarchiver) -> Result<Node> {
        let [elements] = take_inputs::<1>("ReorderDataNode", inputs)?;
        ReorderDataNode::new(
            elements,
            ar.read("input_layout")?,
            ar.read("output_layout")?,
            ar.read("padding")?,
        )
    }
}

impl NodeOps for ReorderDataNode {
    fn base_name(&self) -> &'static str {
        "ReorderDataNode"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_state: true,
            computable: true,
            compilable: true,
            refinable: false,
        }
    }

    fn input_layouts(&self) -> Vec<(usize, &PortMemoryLayout)> {
        vec![(0, &self.input_layout)]
    }

    fn compute(&self, node: &Node, id: NodeId, ctx: &mut ComputeContext) -> Result<()> {
        let elements = Self::input_of(node)?;
        let data = ctx.gather(elements)?;
        let dims = self.source_dims()?;
        let mut out = vec![self.padding; self.output_layout.memory_size()];
        let mut src = vec![0; dims.len()];
        for_each_coordinate(self.output_layout.active_sizes(), |c| {
            for (q, &p) in dims.iter().enumerate() {
                src[q] = c[p];
            }
            out[self.output_layout.entry_offset(c)] = data[self.input_layout.entry_offset(&src)];
        });
        ctx.set_output_f64(id.port(0), elements.port_type(), &out);
        Ok(())
    }

    fn compile(
        &self,
        node: &Node,
        id: NodeId,
        compiler: &mut MapCompiler<'_>,
        function: &mut FunctionEmitter,
    ) -> Result<()> {
        let src = compiler.ensure_elements_emitted(Self::input_of(node)?, function)?;
        let out = compiler.allocate_output(node, id, 0, function)?;
        if self.output_layout.has_padding() && self.padding != 0.0 {
            function.fill(out, self.output_layout.memory_size(), self.padding)?;
        }
        let dims = self.source_dims()?;
        function.for_each_index(self.output_layout.active_sizes(), |f, idx| {
            let src_idx: Vec<Expr> = dims.iter().map(|&p| idx[p].clone()).collect();
            let value = f.load(src, f.layout_offset(&self.input_layout, &src_idx));
            let dst = f.layout_offset(&self.output_layout, idx);
            f.store(out, dst, value);
            Ok(())
        })
    }

    fn write_state(&self, _node: &Node, ar: &mut dyn Archiver) -> Result<()> {
        ar.write("input_layout", &self.input_layout)?;
        ar.write("output_layout", &self.output_layout)?;
        ar.write("padding", &self.padding)
    }
}
