// dot.rs — Graphviz DOT output for models
//
// One DOT node per model node, one edge per input range.
//
// Preconditions: none.
// Postconditions: returns a valid DOT string; node order follows ids.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::fmt::{self, Write};

use crate::model::Model;
use crate::node::Node;
use crate::nodes::NodeKind;

/// Emit the model as a Graphviz DOT string.
pub fn emit_dot(model: &Model) -> String {
    let mut buf = String::new();
    // writing into a String cannot fail
    let _ = write_dot(&mut buf, model);
    buf
}

fn write_dot(buf: &mut String, model: &Model) -> fmt::Result {
    writeln!(buf, "digraph model {{")?;
    writeln!(buf, "    rankdir=LR;")?;
    writeln!(buf, "    node [fontname=\"Helvetica\", fontsize=10, shape=box];")?;
    writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];")?;

    if !model.is_empty() {
        writeln!(buf)?;
    }
    for (id, node) in model.iter() {
        writeln!(
            buf,
            "    {} [label=\"{}: {}\"{}];",
            id,
            id,
            escape(&node.type_name()),
            node_style(node)
        )?;
    }

    let mut first = true;
    for (id, node) in model.iter() {
        for input in node.inputs() {
            for range in input.elements().ranges() {
                if first {
                    writeln!(buf)?;
                    first = false;
                }
                let producer = model
                    .output_port(range.port)
                    .map(|p| p.name().to_string())
                    .unwrap_or_else(|_| format!("#{}", range.port.index));
                writeln!(
                    buf,
                    "    {} -> {} [label=\"{}[{}..{}] -> {}\"];",
                    range.port.node,
                    id,
                    escape(&producer),
                    range.start,
                    range.end(),
                    escape(input.name())
                )?;
            }
        }
    }

    writeln!(buf, "}}")
}

fn node_style(node: &Node) -> &'static str {
    match node.kind() {
        NodeKind::Input(_) | NodeKind::Source(_) => ", shape=invhouse",
        NodeKind::Output(_) | NodeKind::Sink(_) => ", shape=house",
        NodeKind::Constant(_) => ", shape=ellipse, style=dashed",
        _ => "",
    }
}

/// Escape a label for a double-quoted DOT string.
fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{PortMemoryLayout, PortType};
    use crate::nodes::{InputNode, OutputNode};

    #[test]
    fn empty_model() {
        assert_eq!(
            emit_dot(&Model::new()),
            "digraph model {\n    rankdir=LR;\n    node [fontname=\"Helvetica\", fontsize=10, shape=box];\n    edge [fontname=\"Helvetica\", fontsize=9];\n}\n"
        );
    }

    #[test]
    fn one_edge_per_range() {
        let mut model = Model::new();
        let x = model
            .add_node(InputNode::new(PortType::Real32, PortMemoryLayout::flat(2)))
            .unwrap();
        model
            .add_node(OutputNode::new(model.port_elements(x.port(0)).unwrap()))
            .unwrap();
        let dot = emit_dot(&model);
        assert!(dot.contains("n0 [label=\"n0: InputNode<real32>\", shape=invhouse];"));
        assert!(dot.contains("n0 -> n1 [label=\"output[0..2] -> input\"];"));
    }

    #[test]
    fn quotes_are_escaped() {
        assert_eq!(escape("a\"b"), "a\\\"b");
    }
}
