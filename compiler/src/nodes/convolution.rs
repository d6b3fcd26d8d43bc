// convolution.rs — Simple (same-padded, strided) 2-D convolution
//
// Image tensors are (row, column, channel). Filter weights are stored as
// [filter][row][column][channel], or [filter][row][column] for depthwise
// convolution (one filter per input channel).
//
// SimpleConvolutionNode is the high-level form: it accepts any input layout,
// treats taps outside the image as zero, and refines into a ConstantNode
// holding the weights plus a SimpleConvolutionComputeNode. The compute node
// reads the padding region directly, so refinement always routes the input
// through a ReorderDataNode that writes `filter_size / 2` zeros around rows
// and columns; a producer's padding memory is never trusted to be zero.

use crate::archive::{Archiver, Unarchiver};
use crate::compiler::MapCompiler;
use crate::compute::ComputeContext;
use crate::emitter::{BinaryOp, Expr, FunctionEmitter};
use crate::error::{GraphError, Result};
use crate::id::NodeId;
use crate::layout::PortMemoryLayout;
use crate::node::{input, output, require_size, take_inputs, Capabilities, Node, NodeOps};
use crate::nodes::{ConstantNode, NodeKind, ReorderDataNode};
use crate::port::PortElements;
use crate::transformer::ModelTransformer;
use crate::value::PortValue;

/// Filter geometry shared by both convolution nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvolutionParams {
    pub filter_size: usize,
    pub stride: usize,
    pub filters: usize,
}

impl ConvolutionParams {
    pub fn new(filter_size: usize, stride: usize, filters: usize) -> Self {
        ConvolutionParams {
            filter_size,
            stride,
            filters,
        }
    }

    fn padding(&self) -> usize {
        self.filter_size / 2
    }
}

/// Logical (rows, columns, channels) of an image layout.
fn image_dims(layout: &PortMemoryLayout) -> Result<[usize; 3]> {
    if layout.rank() != 3 {
        return Err(GraphError::Construction(format!(
            "convolution input must have rank 3, layout is {}",
            layout
        )));
    }
    let dim = |l: usize| {
        layout.logical_active_size(l).ok_or_else(|| {
            GraphError::Construction(format!("layout {} has no logical dimension {}", layout, l))
        })
    };
    Ok([dim(0)?, dim(1)?, dim(2)?])
}

fn output_dims(image: [usize; 3], params: &ConvolutionParams) -> (usize, usize) {
    let [rows, cols, _] = image;
    let out = |n: usize| (n + 2 * params.padding() - params.filter_size) / params.stride + 1;
    (out(rows), out(cols))
}

/// Whether `layout` is interleaved and padded enough for the compute kernel.
fn has_kernel_padding(layout: &PortMemoryLayout, padding: usize) -> bool {
    layout.logical_dimension_order().is_canonical()
        && (0..2).all(|d| {
            layout.offset(d) >= padding
                && layout.stride(d) - layout.offset(d) - layout.active_size(d) >= padding
        })
}

/// Validate parameters and weights; returns whether the weights are depthwise.
fn check_convolution(
    image: [usize; 3],
    params: &ConvolutionParams,
    weights_len: usize,
) -> Result<bool> {
    let k = params.filter_size;
    if k == 0 || k % 2 == 0 || params.stride == 0 || params.filters == 0 || image[0] == 0 || image[1] == 0 {
        return Err(GraphError::Construction(format!(
            "invalid convolution: filter size {}, stride {}, {} filters over a {}x{} image",
            k, params.stride, params.filters, image[0], image[1]
        )));
    }
    let channels = image[2];
    if weights_len == params.filters * k * k * channels {
        Ok(false)
    } else if weights_len == params.filters * k * k && params.filters == channels {
        Ok(true)
    } else {
        Err(GraphError::Construction(format!(
            "{} weights do not fit {} {}x{} filters over {} channels",
            weights_len, params.filters, k, k, channels
        )))
    }
}

/// How a tap outside the active image is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Border {
    Zero,
    /// From the layout's padding region, as the compiled kernel does. Needs an
    /// interleaved layout with enough padding.
    Padding,
}

/// Reference convolution over logical coordinates.
fn convolve(
    x: &[f64],
    layout: &PortMemoryLayout,
    weights: &[f64],
    params: &ConvolutionParams,
    depthwise: bool,
    border: Border,
) -> Result<Vec<f64>> {
    let image = image_dims(layout)?;
    let [rows, cols, channels] = image;
    let (out_rows, out_cols) = output_dims(image, params);
    let order = layout.logical_dimension_order().dims().to_vec();
    let inc = layout.cumulative_increment();
    let k = params.filter_size;
    let p = params.padding() as isize;
    let inside = |r: isize, c: isize| r >= 0 && c >= 0 && (r as usize) < rows && (c as usize) < cols;
    let read = |r: isize, c: isize, ch: usize| {
        if inside(r, c) {
            let logical = [r as usize, c as usize, ch];
            let physical: Vec<usize> = order.iter().map(|&l| logical[l]).collect();
            x[layout.entry_offset(&physical)]
        } else {
            let row = (r + layout.offset(0) as isize) as usize;
            let col = (c + layout.offset(1) as isize) as usize;
            x[row * inc[0] + col * inc[1] + ch + layout.offset(2)]
        }
    };

    let mut out = vec![0.0; out_rows * out_cols * params.filters];
    for r in 0..out_rows {
        for c in 0..out_cols {
            for f in 0..params.filters {
                let mut sum = 0.0;
                for kr in 0..k {
                    let ir = (r * params.stride + kr) as isize - p;
                    for kc in 0..k {
                        let ic = (c * params.stride + kc) as isize - p;
                        if border == Border::Zero && !inside(ir, ic) {
                            continue;
                        }
                        if depthwise {
                            sum += read(ir, ic, f) * weights[(f * k + kr) * k + kc];
                        } else {
                            for ch in 0..channels {
                                sum += read(ir, ic, ch) * weights[((f * k + kr) * k + kc) * channels + ch];
                            }
                        }
                    }
                }
                out[(r * out_cols + c) * params.filters + f] = sum;
            }
        }
    }
    Ok(out)
}

fn output_layout(image: [usize; 3], params: &ConvolutionParams) -> PortMemoryLayout {
    let (out_rows, out_cols) = output_dims(image, params);
    PortMemoryLayout::contiguous(vec![out_rows, out_cols, params.filters])
}

fn read_params(ar: &dyn Unarchiver, stride_default: Option<usize>) -> Result<ConvolutionParams> {
    let stride = match stride_default {
        Some(d) => ar.read_or("stride", d)?,
        None => ar.read("stride")?,
    };
    Ok(ConvolutionParams {
        filter_size: ar.read("filter_size")?,
        stride,
        filters: ar.read("filters")?,
    })
}

fn write_params(ar: &mut dyn Archiver, params: &ConvolutionParams) -> Result<()> {
    ar.write("filter_size", &params.filter_size)?;
    ar.write("stride", &params.stride)?;
    ar.write("filters", &params.filters)
}

// ── SimpleConvolutionNode ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SimpleConvolutionNode {
    input_layout: PortMemoryLayout,
    params: ConvolutionParams,
    weights: PortValue,
    depthwise: bool,
}

impl SimpleConvolutionNode {
    /// Version 2 added `stride`; version 1 archives imply stride 1.
    pub const ARCHIVE_VERSION: u32 = 2;

    #[allow(clippy::new_ret_no_self)]
    pub fn new(
        input_elements: PortElements,
        input_layout: PortMemoryLayout,
        params: ConvolutionParams,
        weights: impl Into<PortValue>,
    ) -> Result<Node> {
        let weights = weights.into();
        let image = image_dims(&input_layout)?;
        require_size("convolution input", &input_elements, input_layout.memory_size())?;
        if !input_elements.port_type().is_real() || weights.port_type() != input_elements.port_type() {
            return Err(GraphError::Construction(format!(
                "convolution needs real input and matching weights, got {} and {}",
                input_elements.port_type(),
                weights.port_type()
            )));
        }
        let depthwise = check_convolution(image, &params, weights.len())?;
        let port_type = input_elements.port_type();
        Ok(Node::from_parts(
            NodeKind::SimpleConvolution(SimpleConvolutionNode {
                input_layout,
                params,
                weights,
                depthwise,
            }),
            vec![input("input", input_elements)],
            vec![output("output", port_type, output_layout(image, &params))],
        ))
    }

    pub fn params(&self) -> &ConvolutionParams {
        &self.params
    }

    pub fn is_depthwise(&self) -> bool {
        self.depthwise
    }

    fn input_of(node: &Node) -> Result<&PortElements> {
        node.input(0)
            .map(|i| i.elements())
            .ok_or_else(|| GraphError::Construction("SimpleConvolutionNode has no input".into()))
    }

    pub(crate) fn read_state(version: u32, inputs: Vec<PortElements>, ar: &dyn Unarchiver) -> Result<Node> {
        let [elements] = take_inputs::<1>("SimpleConvolutionNode", inputs)?;
        let stride_default = if version < 2 { Some(1) } else { None };
        SimpleConvolutionNode::new(
            elements,
            ar.read("input_layout")?,
            read_params(ar, stride_default)?,
            ar.read::<PortValue>("weights")?,
        )
    }
}

impl NodeOps for SimpleConvolutionNode {
    fn base_name(&self) -> &'static str {
        "SimpleConvolutionNode"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_state: true,
            computable: true,
            compilable: false,
            refinable: true,
        }
    }

    fn archive_version(&self) -> u32 {
        Self::ARCHIVE_VERSION
    }

    fn input_layouts(&self) -> Vec<(usize, &PortMemoryLayout)> {
        vec![(0, &self.input_layout)]
    }

    fn compute(&self, node: &Node, id: NodeId, ctx: &mut ComputeContext) -> Result<()> {
        let elements = Self::input_of(node)?;
        let x = ctx.gather(elements)?;
        let y = convolve(
            &x,
            &self.input_layout,
            &self.weights.to_f64_vec(),
            &self.params,
            self.depthwise,
            Border::Zero,
        )?;
        ctx.set_output_f64(id.port(0), elements.port_type(), &y);
        Ok(())
    }

    fn refine(&self, node: &Node, id: NodeId, transformer: &mut ModelTransformer) -> Result<bool> {
        let mut x = transformer.transform_port_elements(Self::input_of(node)?)?;
        let mut layout = self.input_layout.clone();
        let padding = self.params.padding();
        // with no border taps only the order matters
        if padding > 0 || !has_kernel_padding(&layout, 0) {
            let [rows, cols, channels] = image_dims(&layout)?;
            let padded = PortMemoryLayout::padded(vec![rows, cols, channels], padding, 2)?;
            let reorder = ReorderDataNode::new(x, layout, padded.clone(), 0.0)?;
            let reorder = transformer.add_node(reorder)?;
            x = transformer.target().port_elements(reorder.port(0))?;
            layout = padded;
        }
        let weights = transformer.add_node(ConstantNode::new(self.weights.clone()))?;
        let weights = transformer.target().port_elements(weights.port(0))?;
        let conv = SimpleConvolutionComputeNode::new(x, weights, layout, self.params)?;
        let conv = transformer.add_node(conv)?;
        let result = transformer.target().port_elements(conv.port(0))?;
        transformer.map_node_output(id.port(0), result);
        Ok(true)
    }

    fn write_state(&self, _node: &Node, ar: &mut dyn Archiver) -> Result<()> {
        ar.write("input_layout", &self.input_layout)?;
        write_params(ar, &self.params)?;
        ar.write("weights", &self.weights)
    }
}

// ── SimpleConvolutionComputeNode ───────────────────────────────────────────

/// Low-level convolution over a padded interleaved image, with the weights
/// supplied on a second input. Border taps read the padding region in both
/// the interpreted and the compiled form, so it must hold zeros for a plain
/// same-padded convolution.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleConvolutionComputeNode {
    input_layout: PortMemoryLayout,
    params: ConvolutionParams,
    depthwise: bool,
}

impl SimpleConvolutionComputeNode {
    pub const ARCHIVE_VERSION: u32 = 1;

    #[allow(clippy::new_ret_no_self)]
    pub fn new(
        input_elements: PortElements,
        weights: PortElements,
        input_layout: PortMemoryLayout,
        params: ConvolutionParams,
    ) -> Result<Node> {
        let image = image_dims(&input_layout)?;
        require_size("convolution input", &input_elements, input_layout.memory_size())?;
        if weights.port_type() != input_elements.port_type() || !weights.port_type().is_real() {
            return Err(GraphError::Construction(format!(
                "convolution needs real input and matching weights, got {} and {}",
                input_elements.port_type(),
                weights.port_type()
            )));
        }
        if !has_kernel_padding(&input_layout, params.padding()) {
            return Err(GraphError::Construction(format!(
                "convolution input layout {} lacks {} elements of interleaved padding",
                input_layout,
                params.padding()
            )));
        }
        let depthwise = check_convolution(image, &params, weights.size())?;
        let port_type = input_elements.port_type();
        Ok(Node::from_parts(
            NodeKind::SimpleConvolutionCompute(SimpleConvolutionComputeNode {
                input_layout,
                params,
                depthwise,
            }),
            vec![input("input", input_elements), input("weights", weights)],
            vec![output("output", port_type, output_layout(image, &params))],
        ))
    }

    fn operands(node: &Node) -> Result<(&PortElements, &PortElements)> {
        match node.inputs() {
            [x, w] => Ok((x.elements(), w.elements())),
            _ => Err(GraphError::Construction(
                "SimpleConvolutionComputeNode needs two inputs".into(),
            )),
        }
    }

    pub(crate) fn read_state(_version: u32, inputs: Vec<PortElements>, ar: &dyn Unarchiver) -> Result<Node> {
        let [x, w] = take_inputs::<2>("SimpleConvolutionComputeNode", inputs)?;
        SimpleConvolutionComputeNode::new(x, w, ar.read("input_layout")?, read_params(ar, None)?)
    }
}

impl NodeOps for SimpleConvolutionComputeNode {
    fn base_name(&self) -> &'static str {
        "SimpleConvolutionComputeNode"
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
        let (ex, ew) = Self::operands(node)?;
        let x = ctx.gather(ex)?;
        let w = ctx.gather(ew)?;
        let y = convolve(&x, &self.input_layout, &w, &self.params, self.depthwise, Border::Padding)?;
        ctx.set_output_f64(id.port(0), ex.port_type(), &y);
        Ok(())
    }

    fn compile(
        &self,
        node: &Node,
        id: NodeId,
        compiler: &mut MapCompiler<'_>,
        function: &mut FunctionEmitter,
    ) -> Result<()> {
        let (ex, ew) = Self::operands(node)?;
        let src = compiler.ensure_elements_emitted(ex, function)?;
        let w = compiler.ensure_elements_emitted(ew, function)?;
        let out = compiler.allocate_output(node, id, 0, function)?;

        let image = image_dims(&self.input_layout)?;
        let channels = image[2];
        let (out_rows, out_cols) = output_dims(image, &self.params);
        let ConvolutionParams {
            filter_size: k,
            stride,
            filters,
        } = self.params;
        let p = self.params.padding();
        let inc = self.input_layout.cumulative_increment();
        let column_step = inc[1];
        let layout = &self.input_layout;
        let depthwise = self.depthwise;

        // Address of (r * stride + kr, c * stride + kc, channel) in padded memory.
        let address = move |r: &Expr, c: &Expr, kr: &Expr, kc: &Expr, channel: Expr| {
            let row = r.clone() * Expr::index(stride) + kr.clone() + Expr::index(layout.offset(0) - p);
            let col = c.clone() * Expr::index(stride) + kc.clone() + Expr::index(layout.offset(1) - p);
            row * Expr::index(inc[0]) + col * Expr::index(inc[1]) + channel + Expr::index(layout.offset(2))
        };

        let body = move |f: &mut FunctionEmitter, fi: Expr| -> Result<()> {
            f.for_range(out_rows, |f, r| {
                f.for_range(out_cols, |f, c| {
                    let o = (r.clone() * Expr::index(out_cols) + c.clone()) * Expr::index(filters) + fi.clone();
                    f.for_range(k, |f, kr| {
                        if depthwise {
                            let base = address(&r, &c, &kr, &Expr::index(0), fi.clone());
                            let lhs = f.pointer(src, base);
                            let rhs = f.pointer(w, (fi.clone() * Expr::index(k) + kr) * Expr::index(k));
                            let dot = f.strided_dot_product(k, lhs, column_step, rhs, 1);
                            let acc = f.operation(BinaryOp::Add, f.load(out, o.clone()), dot);
                            f.store(out, o, acc);
                            Ok(())
                        } else {
                            f.for_range(k, |f, kc| {
                                let base = address(&r, &c, &kr, &kc, Expr::index(0));
                                let lhs = f.pointer(src, base);
                                let woff = ((fi.clone() * Expr::index(k) + kr) * Expr::index(k) + kc)
                                    * Expr::index(channels);
                                let rhs = f.pointer(w, woff);
                                let dot = f.dot_product(channels, lhs, rhs);
                                let acc = f.operation(BinaryOp::Add, f.load(out, o.clone()), dot);
                                f.store(out, o, acc);
                                Ok(())
                            })
                        }
                    })
                })
            })
        };

        if compiler.options().parallelize {
            function.parallel_for(filters, &[src, w, out], body)
        } else {
            function.for_range(filters, body)
        }
    }

    fn write_state(&self, _node: &Node, ar: &mut dyn Archiver) -> Result<()> {
        ar.write("input_layout", &self.input_layout)?;
        write_params(ar, &self.params)
    }
}
