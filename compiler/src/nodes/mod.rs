// nodes — The closed set of node kinds
//
// Each kind lives in its own struct implementing `NodeOps`; `NodeKind` is the
// tagged union the rest of the crate matches on. `KINDS` is the static table
// used to rebuild nodes from archives by base name.

mod binary;
mod convolution;
mod io;
mod matrix;
mod reorder;

pub use binary::{BinaryOperationNode, TypeCastNode};
pub use convolution::{ConvolutionParams, SimpleConvolutionComputeNode, SimpleConvolutionNode};
pub use io::{ConstantNode, InputNode, OutputNode, SinkNode, SourceNode};
pub use matrix::{DenseLayerNode, GemmParams, MatrixMatrixMultiplyNode, MatrixVectorProductNode};
pub use reorder::ReorderDataNode;

use crate::archive::Unarchiver;
use crate::error::Result;
use crate::node::{Node, NodeOps};
use crate::port::PortElements;

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Input(InputNode),
    Constant(ConstantNode),
    Output(OutputNode),
    Source(SourceNode),
    Sink(SinkNode),
    BinaryOperation(BinaryOperationNode),
    TypeCast(TypeCastNode),
    ReorderData(ReorderDataNode),
    MatrixMatrixMultiply(MatrixMatrixMultiplyNode),
    MatrixVectorProduct(MatrixVectorProductNode),
    DenseLayer(DenseLayerNode),
    SimpleConvolution(SimpleConvolutionNode),
    SimpleConvolutionCompute(SimpleConvolutionComputeNode),
}

impl NodeKind {
    pub(crate) fn ops(&self) -> &dyn NodeOps {
        match self {
            NodeKind::Input(n) => n,
            NodeKind::Constant(n) => n,
            NodeKind::Output(n) => n,
            NodeKind::Source(n) => n,
            NodeKind::Sink(n) => n,
            NodeKind::BinaryOperation(n) => n,
            NodeKind::TypeCast(n) => n,
            NodeKind::ReorderData(n) => n,
            NodeKind::MatrixMatrixMultiply(n) => n,
            NodeKind::MatrixVectorProduct(n) => n,
            NodeKind::DenseLayer(n) => n,
            NodeKind::SimpleConvolution(n) => n,
            NodeKind::SimpleConvolutionCompute(n) => n,
        }
    }
}

pub(crate) type ReadFn = fn(u32, Vec<PortElements>, &dyn Unarchiver) -> Result<Node>;

/// Archive entry for one node kind.
pub(crate) struct KindInfo {
    pub name: &'static str,
    pub archive_version: u32,
    pub read: ReadFn,
}

pub(crate) const KINDS: &[KindInfo] = &[
    KindInfo {
        name: "InputNode",
        archive_version: InputNode::ARCHIVE_VERSION,
        read: InputNode::read_state,
    },
    KindInfo {
        name: "ConstantNode",
        archive_version: ConstantNode::ARCHIVE_VERSION,
        read: ConstantNode::read_state,
    },
    KindInfo {
        name: "OutputNode",
        archive_version: OutputNode::ARCHIVE_VERSION,
        read: OutputNode::read_state,
    },
    KindInfo {
        name: "SourceNode",
        archive_version: SourceNode::ARCHIVE_VERSION,
        read: SourceNode::read_state,
    },
    KindInfo {
        name: "SinkNode",
        archive_version: SinkNode::ARCHIVE_VERSION,
        read: SinkNode::read_state,
    },
    KindInfo {
        name: "BinaryOperationNode",
        archive_version: BinaryOperationNode::ARCHIVE_VERSION,
        read: BinaryOperationNode::read_state,
    },
    KindInfo {
        name: "TypeCastNode",
        archive_version: TypeCastNode::ARCHIVE_VERSION,
        read: TypeCastNode::read_state,
    },
    KindInfo {
        name: "ReorderDataNode",
        archive_version: ReorderDataNode::ARCHIVE_VERSION,
        read: ReorderDataNode::read_state,
    },
    KindInfo {
        name: "MatrixMatrixMultiplyNode",
        archive_version: MatrixMatrixMultiplyNode::ARCHIVE_VERSION,
        read: MatrixMatrixMultiplyNode::read_state,
    },
    KindInfo {
        name: "MatrixVectorProductNode",
        archive_version: MatrixVectorProductNode::ARCHIVE_VERSION,
        read: MatrixVectorProductNode::read_state,
    },
    KindInfo {
        name: "DenseLayerNode",
        archive_version: DenseLayerNode::ARCHIVE_VERSION,
        read: DenseLayerNode::read_state,
    },
    KindInfo {
        name: "SimpleConvolutionNode",
        archive_version: SimpleConvolutionNode::ARCHIVE_VERSION,
        read: SimpleConvolutionNode::read_state,
    },
    KindInfo {
        name: "SimpleConvolutionComputeNode",
        archive_version: SimpleConvolutionComputeNode::ARCHIVE_VERSION,
        read: SimpleConvolutionComputeNode::read_state,
    },
];

pub(crate) fn kind_info(name: &str) -> Option<&'static KindInfo> {
    KINDS.iter().find(|k| k.name == name)
}
