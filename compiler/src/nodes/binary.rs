// binary.rs — Coordinatewise binary operations and element type casts

use crate::archive::{Archiver, Unarchiver};
use crate::compiler::MapCompiler;
use crate::compute::ComputeContext;
use crate::emitter::{BinaryOp, FunctionEmitter};
use crate::error::{GraphError, Result};
use crate::id::NodeId;
use crate::layout::{for_each_coordinate, PortMemoryLayout, PortType};
use crate::node::{input, output, require_size, take_inputs, Capabilities, Node, NodeOps};
use crate::nodes::NodeKind;
use crate::port::PortElements;

fn inputs_of(node: &Node) -> Result<(&PortElements, &PortElements)> {
    match node.inputs() {
        [a, b] => Ok((a.elements(), b.elements())),
        _ => Err(GraphError::Construction(format!(
            "{} needs two inputs",
            node.base_name()
        ))),
    }
}

// ── BinaryOperationNode ────────────────────────────────────────────────────

/// Elementwise `input1 op input2` over the active region of `input_layout`,
/// written into `output_layout`. Output padding holds `padding`.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryOperationNode {
    operation: BinaryOp,
    input_layout: PortMemoryLayout,
    output_layout: PortMemoryLayout,
    padding: f64,
}

impl BinaryOperationNode {
    pub const ARCHIVE_VERSION: u32 = 1;

    /// Operation over flat, unpadded inputs.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(operation: BinaryOp, input1: PortElements, input2: PortElements) -> Result<Node> {
        let layout = PortMemoryLayout::flat(input1.size());
        Self::with_layouts(operation, input1, input2, layout.clone(), layout, 0.0)
    }

    pub fn with_layouts(
        operation: BinaryOp,
        input1: PortElements,
        input2: PortElements,
        input_layout: PortMemoryLayout,
        output_layout: PortMemoryLayout,
        padding: f64,
    ) -> Result<Node> {
        let port_type = input1.port_type();
        if input2.port_type() != port_type {
            return Err(GraphError::Construction(format!(
                "{} operands differ in type: {} and {}",
                operation,
                port_type,
                input2.port_type()
            )));
        }
        if operation.is_logical() != (port_type == PortType::Boolean) {
            return Err(GraphError::Construction(format!(
                "{} is not defined on {} elements",
                operation, port_type
            )));
        }
        require_size("input1", &input1, input_layout.memory_size())?;
        require_size("input2", &input2, input_layout.memory_size())?;
        if input_layout.active_sizes() != output_layout.active_sizes()
            || input_layout.logical_dimension_order() != output_layout.logical_dimension_order()
        {
            return Err(GraphError::Construction(format!(
                "output layout ({}) does not match input layout ({})",
                output_layout, input_layout
            )));
        }
        let out = output("output", port_type, output_layout.clone());
        Ok(Node::from_parts(
            NodeKind::BinaryOperation(BinaryOperationNode {
                operation,
                input_layout,
                output_layout,
                padding,
            }),
            vec![input("input1", input1), input("input2", input2)],
            vec![out],
        ))
    }

    pub fn operation(&self) -> BinaryOp {
        self.operation
    }

    pub fn input_layout(&self) -> &PortMemoryLayout {
        &self.input_layout
    }

    pub(crate) fn read_state(_version: u32, inputs: Vec<PortElements>, ar: &dyn Unarchiver) -> Result<Node> {
        let [a, b] = take_inputs::<2>("BinaryOperationNode", inputs)?;
        BinaryOperationNode::with_layouts(
            ar.read("operation")?,
            a,
            b,
            ar.read("input_layout")?,
            ar.read("output_layout")?,
            ar.read("padding")?,
        )
    }
}

impl NodeOps for BinaryOperationNode {
    fn base_name(&self) -> &'static str {
        "BinaryOperationNode"
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
        vec![(0, &self.input_layout), (1, &self.input_layout)]
    }

    fn compute(&self, node: &Node, id: NodeId, ctx: &mut ComputeContext) -> Result<()> {
        let (e1, e2) = inputs_of(node)?;
        let a = ctx.gather(e1)?;
        let b = ctx.gather(e2)?;
        let mut out = vec![self.padding; self.output_layout.memory_size()];
        for_each_coordinate(self.input_layout.active_sizes(), |c| {
            let src = self.input_layout.entry_offset(c);
            out[self.output_layout.entry_offset(c)] = self.operation.apply(a[src], b[src]);
        });
        ctx.set_output_f64(id.port(0), e1.port_type(), &out);
        Ok(())
    }

    fn compile(
        &self,
        node: &Node,
        id: NodeId,
        compiler: &mut MapCompiler<'_>,
        function: &mut FunctionEmitter,
    ) -> Result<()> {
        let (e1, e2) = inputs_of(node)?;
        let a = compiler.ensure_elements_emitted(e1, function)?;
        let b = compiler.ensure_elements_emitted(e2, function)?;
        let out = compiler.allocate_output(node, id, 0, function)?;
        if self.output_layout.has_padding() && self.padding != 0.0 {
            function.fill(out, self.output_layout.memory_size(), self.padding)?;
        }
        function.for_each_index(self.input_layout.active_sizes(), |f, idx| {
            let src = f.layout_offset(&self.input_layout, idx);
            let dst = f.layout_offset(&self.output_layout, idx);
            let value = f.operation(self.operation, f.load(a, src.clone()), f.load(b, src));
            f.store(out, dst, value);
            Ok(())
        })
    }

    fn write_state(&self, _node: &Node, ar: &mut dyn Archiver) -> Result<()> {
        ar.write("operation", &self.operation)?;
        ar.write("input_layout", &self.input_layout)?;
        ar.write("output_layout", &self.output_layout)?;
        ar.write("padding", &self.padding)
    }
}

// ── TypeCastNode ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeCastNode {
    output_type: PortType,
}

impl TypeCastNode {
    pub const ARCHIVE_VERSION: u32 = 1;

    #[allow(clippy::new_ret_no_self)]
    pub fn new(input_elements: PortElements, output_type: PortType) -> Node {
        let layout = PortMemoryLayout::flat(input_elements.size());
        Node::from_parts(
            NodeKind::TypeCast(TypeCastNode { output_type }),
            vec![input("input", input_elements)],
            vec![output("output", output_type, layout)],
        )
    }

    pub(crate) fn read_state(_version: u32, inputs: Vec<PortElements>, ar: &dyn Unarchiver) -> Result<Node> {
        let [elements] = take_inputs::<1>("TypeCastNode", inputs)?;
        Ok(TypeCastNode::new(elements, ar.read("output_type")?))
    }
}

impl NodeOps for TypeCastNode {
    fn base_name(&self) -> &'static str {
        "TypeCastNode"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_state: true,
            computable: true,
            compilable: true,
            refinable: false,
        }
    }

    fn compute(&self, node: &Node, id: NodeId, ctx: &mut ComputeContext) -> Result<()> {
        let elements = node
            .input(0)
            .ok_or_else(|| GraphError::Construction("TypeCastNode has no input".into()))?
            .elements();
        let data = ctx.gather(elements)?;
        ctx.set_output_f64(id.port(0), self.output_type, &data);
        Ok(())
    }

    fn compile(
        &self,
        node: &Node,
        id: NodeId,
        compiler: &mut MapCompiler<'_>,
        function: &mut FunctionEmitter,
    ) -> Result<()> {
        let port = node
            .input(0)
            .ok_or_else(|| GraphError::Construction("TypeCastNode has no input".into()))?;
        let src = compiler.ensure_elements_emitted(port.elements(), function)?;
        let out = compiler.allocate_output(node, id, 0, function)?;
        let to = self.output_type;
        function.for_range(port.size(), |f, i| {
            let value = f.cast(to, f.load(src, i.clone()));
            f.store(out, i, value);
            Ok(())
        })
    }

    fn write_state(&self, _node: &Node, ar: &mut dyn Archiver) -> Result<()> {
        ar.write("output_type", &self.output_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use crate::value::PortValue;

    #[test]
    fn logical_ops_need_boolean_operands() {
        let mut model = Model::new();
        let c = model.add_node(crate::nodes::ConstantNode::new(vec![1.0f32])).unwrap();
        let e = model.port_elements(c.port(0)).unwrap();
        assert!(BinaryOperationNode::new(BinaryOp::LogicalAnd, e.clone(), e).is_err());
    }

    #[test]
    fn padded_output_keeps_padding_value() {
        let mut model = Model::new();
        let a = model.add_node(crate::nodes::ConstantNode::new(vec![1.0f64, 2.0])).unwrap();
        let b = model.add_node(crate::nodes::ConstantNode::new(vec![3.0f64, 4.0])).unwrap();
        let ea = model.port_elements(a.port(0)).unwrap();
        let eb = model.port_elements(b.port(0)).unwrap();
        let out_layout = PortMemoryLayout::padded(vec![2], 1, 1).unwrap();
        let node = BinaryOperationNode::with_layouts(
            BinaryOp::Multiply,
            ea,
            eb,
            PortMemoryLayout::flat(2),
            out_layout,
            -1.0,
        )
        .unwrap();
        let id = model.add_node(node).unwrap();
        let mut ctx = ComputeContext::new();
        for (nid, n) in model.iter() {
            n.compute(nid, &mut ctx).unwrap();
        }
        assert_eq!(
            ctx.output(id.port(0)),
            Some(&PortValue::from(vec![-1.0f64, 3.0, 8.0, -1.0]))
        );
    }

    #[test]
    fn cast_truncates_to_integer() {
        let mut model = Model::new();
        let c = model.add_node(crate::nodes::ConstantNode::new(vec![1.5f32, -2.5])).unwrap();
        let e = model.port_elements(c.port(0)).unwrap();
        let cast = model.add_node(TypeCastNode::new(e, PortType::Integer)).unwrap();
        let mut ctx = ComputeContext::new();
        for (nid, n) in model.iter() {
            n.compute(nid, &mut ctx).unwrap();
        }
        assert_eq!(ctx.output(cast.port(0)), Some(&PortValue::from(vec![1i32, -2])));
    }
}
