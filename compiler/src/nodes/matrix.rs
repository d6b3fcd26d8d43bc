// matrix.rs — Matrix multiply, matrix-vector product and dense layer nodes
//
// Lowering chain: DenseLayerNode refines into MatrixVectorProductNode +
// ConstantNode(bias) + BinaryOperationNode(add); MatrixVectorProductNode
// refines into ConstantNode(weights) + MatrixMatrixMultiplyNode. Only the
// last one is compilable, so a dense layer needs two refinement passes.

use crate::archive::{Archiver, Unarchiver};
use crate::compiler::MapCompiler;
use crate::compute::ComputeContext;
use crate::emitter::{BinaryOp, Expr, FunctionEmitter};
use crate::error::{GraphError, Result};
use crate::id::NodeId;
use crate::layout::PortMemoryLayout;
use crate::node::{input, output, require_size, take_inputs, Capabilities, Node, NodeOps};
use crate::nodes::{BinaryOperationNode, ConstantNode, NodeKind};
use crate::port::PortElements;
use crate::transformer::ModelTransformer;
use crate::value::PortValue;

fn require_real(what: &str, elements: &PortElements) -> Result<()> {
    if !elements.port_type().is_real() {
        return Err(GraphError::Construction(format!(
            "{} must be real-valued, got {}",
            what,
            elements.port_type()
        )));
    }
    Ok(())
}

fn sole_input(node: &Node) -> Result<&PortElements> {
    node.input(0)
        .map(|i| i.elements())
        .ok_or_else(|| GraphError::Construction(format!("{} has no input", node.base_name())))
}

// ── MatrixMatrixMultiplyNode ───────────────────────────────────────────────

/// GEMM shape: `C[m x n] = op(A)[m x k] * op(B)[k x n]`, row-major, with
/// leading dimensions for A and B.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmParams {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub lda: usize,
    pub ldb: usize,
    pub transpose_a: bool,
    pub transpose_b: bool,
}

impl GemmParams {
    /// Untransposed, densely packed operands.
    pub fn new(m: usize, n: usize, k: usize) -> Self {
        GemmParams {
            m,
            n,
            k,
            lda: k,
            ldb: n,
            transpose_a: false,
            transpose_b: false,
        }
    }

    /// (rows, minimum leading dimension) of the stored A matrix.
    fn a_storage(&self) -> (usize, usize) {
        if self.transpose_a {
            (self.k, self.m)
        } else {
            (self.m, self.k)
        }
    }

    fn b_storage(&self) -> (usize, usize) {
        if self.transpose_b {
            (self.n, self.k)
        } else {
            (self.k, self.n)
        }
    }

    /// Offset of row `i` of op(A) and the stride between its elements.
    fn a_row(&self, i: usize) -> (usize, usize) {
        if self.transpose_a {
            (i, self.lda)
        } else {
            (i * self.lda, 1)
        }
    }

    /// Offset of column `j` of op(B) and the stride between its elements.
    fn b_col(&self, j: usize) -> (usize, usize) {
        if self.transpose_b {
            (j * self.ldb, 1)
        } else {
            (j, self.ldb)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixMatrixMultiplyNode {
    params: GemmParams,
}

impl MatrixMatrixMultiplyNode {
    pub const ARCHIVE_VERSION: u32 = 1;

    #[allow(clippy::new_ret_no_self)]
    pub fn new(a: PortElements, b: PortElements, m: usize, n: usize, k: usize) -> Result<Node> {
        Self::with_params(a, b, GemmParams::new(m, n, k))
    }

    pub fn with_params(a: PortElements, b: PortElements, params: GemmParams) -> Result<Node> {
        require_real("matrix A", &a)?;
        if b.port_type() != a.port_type() {
            return Err(GraphError::Construction(format!(
                "matrix operands differ in type: {} and {}",
                a.port_type(),
                b.port_type()
            )));
        }
        let (a_rows, a_min_ld) = params.a_storage();
        let (b_rows, b_min_ld) = params.b_storage();
        if params.lda < a_min_ld || params.ldb < b_min_ld {
            return Err(GraphError::Construction(format!(
                "leading dimensions lda={} ldb={} too small for {}x{}x{}",
                params.lda, params.ldb, params.m, params.n, params.k
            )));
        }
        require_size("matrix A", &a, a_rows * params.lda)?;
        require_size("matrix B", &b, b_rows * params.ldb)?;
        let port_type = a.port_type();
        Ok(Node::from_parts(
            NodeKind::MatrixMatrixMultiply(MatrixMatrixMultiplyNode { params }),
            vec![input("input1", a), input("input2", b)],
            vec![output(
                "output",
                port_type,
                PortMemoryLayout::contiguous(vec![params.m, params.n]),
            )],
        ))
    }

    pub fn params(&self) -> &GemmParams {
        &self.params
    }

    fn operands(node: &Node) -> Result<(&PortElements, &PortElements)> {
        match node.inputs() {
            [a, b] => Ok((a.elements(), b.elements())),
            _ => Err(GraphError::Construction(
                "MatrixMatrixMultiplyNode needs two inputs".into(),
            )),
        }
    }

    pub(crate) fn read_state(_version: u32, inputs: Vec<PortElements>, ar: &dyn Unarchiver) -> Result<Node> {
        let [a, b] = take_inputs::<2>("MatrixMatrixMultiplyNode", inputs)?;
        let params = GemmParams {
            m: ar.read("m")?,
            n: ar.read("n")?,
            k: ar.read("k")?,
            lda: ar.read("lda")?,
            ldb: ar.read("ldb")?,
            transpose_a: ar.read("transpose_a")?,
            transpose_b: ar.read("transpose_b")?,
        };
        MatrixMatrixMultiplyNode::with_params(a, b, params)
    }
}

impl NodeOps for MatrixMatrixMultiplyNode {
    fn base_name(&self) -> &'static str {
        "MatrixMatrixMultiplyNode"
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
        let (ea, eb) = Self::operands(node)?;
        let a = ctx.gather(ea)?;
        let b = ctx.gather(eb)?;
        let p = &self.params;
        let mut c = vec![0.0; p.m * p.n];
        for i in 0..p.m {
            let (a0, sa) = p.a_row(i);
            for j in 0..p.n {
                let (b0, sb) = p.b_col(j);
                c[i * p.n + j] = (0..p.k).map(|l| a[a0 + l * sa] * b[b0 + l * sb]).sum();
            }
        }
        ctx.set_output_f64(id.port(0), ea.port_type(), &c);
        Ok(())
    }

    fn compile(
        &self,
        node: &Node,
        id: NodeId,
        compiler: &mut MapCompiler<'_>,
        function: &mut FunctionEmitter,
    ) -> Result<()> {
        let (ea, eb) = Self::operands(node)?;
        let a = compiler.ensure_elements_emitted(ea, function)?;
        let b = compiler.ensure_elements_emitted(eb, function)?;
        let c = compiler.allocate_output(node, id, 0, function)?;
        let p = self.params;
        let (a_row_step, a_stride) = if p.transpose_a { (1, p.lda) } else { (p.lda, 1) };
        let (b_col_step, b_stride) = if p.transpose_b { (p.ldb, 1) } else { (1, p.ldb) };
        function.for_range(p.m, |f, i| {
            f.for_range(p.n, |f, j| {
                let lhs = f.pointer(a, i.clone() * Expr::index(a_row_step));
                let rhs = f.pointer(b, j.clone() * Expr::index(b_col_step));
                let dot = f.strided_dot_product(p.k, lhs, a_stride, rhs, b_stride);
                f.store(c, i * Expr::index(p.n) + j, dot);
                Ok(())
            })
        })
    }

    fn write_state(&self, _node: &Node, ar: &mut dyn Archiver) -> Result<()> {
        let p = &self.params;
        ar.write("m", &p.m)?;
        ar.write("n", &p.n)?;
        ar.write("k", &p.k)?;
        ar.write("lda", &p.lda)?;
        ar.write("ldb", &p.ldb)?;
        ar.write("transpose_a", &p.transpose_a)?;
        ar.write("transpose_b", &p.transpose_b)
    }
}

// ── MatrixVectorProductNode ────────────────────────────────────────────────

/// `output = W * input` with a stored `rows x cols` row-major matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixVectorProductNode {
    rows: usize,
    cols: usize,
    weights: PortValue,
}

fn matrix_vector(weights: &[f64], rows: usize, cols: usize, x: &[f64]) -> Vec<f64> {
    (0..rows)
        .map(|r| (0..cols).map(|c| weights[r * cols + c] * x[c]).sum())
        .collect()
}

fn check_weights(what: &str, weights: &PortValue, expected: usize, input: &PortElements) -> Result<()> {
    if weights.port_type() != input.port_type() {
        return Err(GraphError::Construction(format!(
            "{} are {} but the input is {}",
            what,
            weights.port_type(),
            input.port_type()
        )));
    }
    if weights.len() != expected {
        return Err(GraphError::Construction(format!(
            "{} hold {} values, expected {}",
            what,
            weights.len(),
            expected
        )));
    }
    Ok(())
}

impl MatrixVectorProductNode {
    pub const ARCHIVE_VERSION: u32 = 1;

    #[allow(clippy::new_ret_no_self)]
    pub fn new(
        input_elements: PortElements,
        rows: usize,
        cols: usize,
        weights: impl Into<PortValue>,
    ) -> Result<Node> {
        let weights = weights.into();
        require_real("matrix-vector input", &input_elements)?;
        require_size("matrix-vector input", &input_elements, cols)?;
        check_weights("weights", &weights, rows * cols, &input_elements)?;
        let port_type = input_elements.port_type();
        Ok(Node::from_parts(
            NodeKind::MatrixVectorProduct(MatrixVectorProductNode {
                rows,
                cols,
                weights,
            }),
            vec![input("input", input_elements)],
            vec![output("output", port_type, PortMemoryLayout::flat(rows))],
        ))
    }

    pub(crate) fn read_state(_version: u32, inputs: Vec<PortElements>, ar: &dyn Unarchiver) -> Result<Node> {
        let [elements] = take_inputs::<1>("MatrixVectorProductNode", inputs)?;
        MatrixVectorProductNode::new(
            elements,
            ar.read("rows")?,
            ar.read("cols")?,
            ar.read::<PortValue>("weights")?,
        )
    }
}

impl NodeOps for MatrixVectorProductNode {
    fn base_name(&self) -> &'static str {
        "MatrixVectorProductNode"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_state: true,
            computable: true,
            compilable: false,
            refinable: true,
        }
    }

    fn compute(&self, node: &Node, id: NodeId, ctx: &mut ComputeContext) -> Result<()> {
        let elements = sole_input(node)?;
        let x = ctx.gather(elements)?;
        let y = matrix_vector(&self.weights.to_f64_vec(), self.rows, self.cols, &x);
        ctx.set_output_f64(id.port(0), elements.port_type(), &y);
        Ok(())
    }

    fn refine(&self, node: &Node, id: NodeId, transformer: &mut ModelTransformer) -> Result<bool> {
        let x = transformer.transform_port_elements(sole_input(node)?)?;
        let w = transformer.add_node(ConstantNode::new(self.weights.clone()))?;
        let w_elements = transformer.target().port_elements(w.port(0))?;
        let gemm = MatrixMatrixMultiplyNode::new(w_elements, x, self.rows, 1, self.cols)?;
        let gemm = transformer.add_node(gemm)?;
        let result = transformer.target().port_elements(gemm.port(0))?;
        transformer.map_node_output(id.port(0), result);
        Ok(true)
    }

    fn write_state(&self, _node: &Node, ar: &mut dyn Archiver) -> Result<()> {
        ar.write("rows", &self.rows)?;
        ar.write("cols", &self.cols)?;
        ar.write("weights", &self.weights)
    }
}

// ── DenseLayerNode ─────────────────────────────────────────────────────────

/// Fully connected layer: `output = W * input + bias`.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseLayerNode {
    rows: usize,
    cols: usize,
    weights: PortValue,
    bias: PortValue,
}

impl DenseLayerNode {
    pub const ARCHIVE_VERSION: u32 = 1;

    #[allow(clippy::new_ret_no_self)]
    pub fn new(
        input_elements: PortElements,
        rows: usize,
        cols: usize,
        weights: impl Into<PortValue>,
        bias: impl Into<PortValue>,
    ) -> Result<Node> {
        let (weights, bias) = (weights.into(), bias.into());
        require_real("dense input", &input_elements)?;
        require_size("dense input", &input_elements, cols)?;
        check_weights("weights", &weights, rows * cols, &input_elements)?;
        check_weights("bias values", &bias, rows, &input_elements)?;
        let port_type = input_elements.port_type();
        Ok(Node::from_parts(
            NodeKind::DenseLayer(DenseLayerNode {
                rows,
                cols,
                weights,
                bias,
            }),
            vec![input("input", input_elements)],
            vec![output("output", port_type, PortMemoryLayout::flat(rows))],
        ))
    }

    pub(crate) fn read_state(_version: u32, inputs: Vec<PortElements>, ar: &dyn Unarchiver) -> Result<Node> {
        let [elements] = take_inputs::<1>("DenseLayerNode", inputs)?;
        DenseLayerNode::new(
            elements,
            ar.read("rows")?,
            ar.read("cols")?,
            ar.read::<PortValue>("weights")?,
            ar.read::<PortValue>("bias")?,
        )
    }
}

impl NodeOps for DenseLayerNode {
    fn base_name(&self) -> &'static str {
        "DenseLayerNode"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_state: true,
            computable: true,
            compilable: false,
            refinable: true,
        }
    }

    fn compute(&self, node: &Node, id: NodeId, ctx: &mut ComputeContext) -> Result<()> {
        let elements = sole_input(node)?;
        let x = ctx.gather(elements)?;
        let mut y = matrix_vector(&self.weights.to_f64_vec(), self.rows, self.cols, &x);
        for (v, b) in y.iter_mut().zip(self.bias.to_f64_vec()) {
            *v += b;
        }
        ctx.set_output_f64(id.port(0), elements.port_type(), &y);
        Ok(())
    }

    fn refine(&self, node: &Node, id: NodeId, transformer: &mut ModelTransformer) -> Result<bool> {
        let x = transformer.transform_port_elements(sole_input(node)?)?;
        let product = MatrixVectorProductNode::new(x, self.rows, self.cols, self.weights.clone())?;
        let product = transformer.add_node(product)?;
        let bias = transformer.add_node(ConstantNode::new(self.bias.clone()))?;
        let lhs = transformer.target().port_elements(product.port(0))?;
        let rhs = transformer.target().port_elements(bias.port(0))?;
        let sum = transformer.add_node(BinaryOperationNode::new(BinaryOp::Add, lhs, rhs)?)?;
        let result = transformer.target().port_elements(sum.port(0))?;
        transformer.map_node_output(id.port(0), result);
        Ok(true)
    }

    fn write_state(&self, _node: &Node, ar: &mut dyn Archiver) -> Result<()> {
        ar.write("rows", &self.rows)?;
        ar.write("cols", &self.cols)?;
        ar.write("weights", &self.weights)?;
        ar.write("bias", &self.bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;

    fn eval(model: &Model, port: crate::id::PortRef) -> Vec<f64> {
        let mut ctx = ComputeContext::new();
        for (id, node) in model.iter() {
            node.compute(id, &mut ctx).unwrap();
        }
        ctx.output(port).unwrap().to_f64_vec()
    }

    #[test]
    fn gemm_with_transposed_a() {
        // A^T stored as 3x2: A = [[1, 3, 5], [2, 4, 6]]
        let mut model = Model::new();
        let a = model.add_node(ConstantNode::new(vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0])).unwrap();
        let b = model.add_node(ConstantNode::new(vec![1.0f64, 1.0, 1.0])).unwrap();
        let params = GemmParams {
            lda: 2,
            ldb: 1,
            transpose_a: true,
            ..GemmParams::new(2, 1, 3)
        };
        let node = MatrixMatrixMultiplyNode::with_params(
            model.port_elements(a.port(0)).unwrap(),
            model.port_elements(b.port(0)).unwrap(),
            params,
        )
        .unwrap();
        let c = model.add_node(node).unwrap();
        assert_eq!(eval(&model, c.port(0)), vec![9.0, 12.0]);
    }

    #[test]
    fn gemm_rejects_short_operand() {
        let mut model = Model::new();
        let a = model.add_node(ConstantNode::new(vec![1.0f32; 5])).unwrap();
        let b = model.add_node(ConstantNode::new(vec![1.0f32; 3])).unwrap();
        let err = MatrixMatrixMultiplyNode::new(
            model.port_elements(a.port(0)).unwrap(),
            model.port_elements(b.port(0)).unwrap(),
            2,
            1,
            3,
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::Construction(_)));
    }

    #[test]
    fn dense_layer_computes_affine_map() {
        let mut model = Model::new();
        let x = model.add_node(ConstantNode::new(vec![1.0f32, 2.0])).unwrap();
        let dense = DenseLayerNode::new(
            model.port_elements(x.port(0)).unwrap(),
            2,
            2,
            vec![1.0f32, 0.0, 1.0, 1.0],
            vec![10.0f32, 20.0],
        )
        .unwrap();
        let d = model.add_node(dense).unwrap();
        assert_eq!(eval(&model, d.port(0)), vec![11.0, 23.0]);
    }
}
