// port.rs — Input/output ports and PortElements reference expressions
//
// An output port is owned by its node and carries a type and a fixed memory
// layout. An input port is bound at construction to a `PortElements`: an
// ordered list of (output, start, count) ranges sharing one element type.
// PortElements refer to outputs by `PortRef` only; the owning model resolves
// them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::id::{NodeId, PortRef};
use crate::layout::{PortMemoryLayout, PortType};

/// A contiguous slice `[start, start + count)` of one output port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub port: PortRef,
    pub start: usize,
    pub count: usize,
}

impl PortRange {
    pub fn new(port: PortRef, start: usize, count: usize) -> Self {
        PortRange { port, start, count }
    }

    pub fn end(&self) -> usize {
        self.start + self.count
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}..{}]", self.port, self.start, self.end())
    }
}

/// Ordered selection of output elements, all of one type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortElements {
    port_type: PortType,
    ranges: Vec<PortRange>,
}

impl PortElements {
    pub fn empty(port_type: PortType) -> Self {
        PortElements {
            port_type,
            ranges: Vec::new(),
        }
    }

    /// Elements from explicit ranges. Adjacent ranges of the same port merge.
    pub fn from_ranges(port_type: PortType, ranges: impl IntoIterator<Item = PortRange>) -> Self {
        let mut elements = PortElements::empty(port_type);
        for r in ranges {
            elements.push_range(r);
        }
        elements
    }

    pub fn port_type(&self) -> PortType {
        self.port_type
    }

    pub fn ranges(&self) -> &[PortRange] {
        &self.ranges
    }

    pub fn size(&self) -> usize {
        self.ranges.iter().map(|r| r.count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The single range, when these elements select from exactly one port.
    pub fn single_range(&self) -> Option<&PortRange> {
        match self.ranges.as_slice() {
            [r] => Some(r),
            _ => None,
        }
    }

    pub fn referenced_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.ranges.iter().map(|r| r.port.node)
    }

    fn push_range(&mut self, range: PortRange) {
        if range.count == 0 {
            return;
        }
        if let Some(last) = self.ranges.last_mut() {
            if last.port == range.port && last.end() == range.start {
                last.count += range.count;
                return;
            }
        }
        self.ranges.push(range);
    }

    /// Append `other`; both sides must have the same element type.
    pub fn append(&mut self, other: &PortElements) -> Result<()> {
        if other.port_type != self.port_type {
            return Err(GraphError::Construction(format!(
                "cannot concatenate {} elements onto {} elements",
                other.port_type, self.port_type
            )));
        }
        for r in &other.ranges {
            self.push_range(r.clone());
        }
        Ok(())
    }

    /// Concatenation of `parts` in order.
    pub fn concat(parts: &[PortElements]) -> Result<PortElements> {
        let first = parts.first().ok_or_else(|| {
            GraphError::Construction("cannot concatenate an empty list of elements".into())
        })?;
        let mut out = PortElements::empty(first.port_type);
        for p in parts {
            out.append(p)?;
        }
        Ok(out)
    }

    /// Elements `[start, start + count)` of this selection.
    pub fn slice(&self, start: usize, count: usize) -> Result<PortElements> {
        if start + count > self.size() {
            return Err(GraphError::Construction(format!(
                "slice [{}..{}] exceeds {} elements",
                start,
                start + count,
                self.size()
            )));
        }
        let mut out = PortElements::empty(self.port_type);
        let mut skip = start;
        let mut remaining = count;
        for r in &self.ranges {
            if remaining == 0 {
                break;
            }
            if skip >= r.count {
                skip -= r.count;
                continue;
            }
            let take = (r.count - skip).min(remaining);
            out.push_range(PortRange::new(r.port, r.start + skip, take));
            remaining -= take;
            skip = 0;
        }
        Ok(out)
    }
}

impl fmt::Display for PortElements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ranges.is_empty() {
            return write!(f, "<empty>");
        }
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", r)?;
        }
        Ok(())
    }
}

/// Producing endpoint; layout fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPort {
    name: String,
    port_type: PortType,
    layout: PortMemoryLayout,
}

impl OutputPort {
    pub fn new(name: impl Into<String>, port_type: PortType, layout: PortMemoryLayout) -> Self {
        OutputPort {
            name: name.into(),
            port_type,
            layout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port_type(&self) -> PortType {
        self.port_type
    }

    pub fn layout(&self) -> &PortMemoryLayout {
        &self.layout
    }

    /// Number of addressable elements, padding included.
    pub fn size(&self) -> usize {
        self.layout.memory_size()
    }
}

/// Consuming endpoint bound to a PortElements expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPort {
    name: String,
    elements: PortElements,
}

impl InputPort {
    pub fn new(name: impl Into<String>, elements: PortElements) -> Self {
        InputPort {
            name: name.into(),
            elements,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn elements(&self) -> &PortElements {
        &self.elements
    }

    pub fn port_type(&self) -> PortType {
        self.elements.port_type()
    }

    pub fn size(&self) -> usize {
        self.elements.size()
    }

    pub(crate) fn rebind(&mut self, elements: PortElements) {
        self.elements = elements;
    }
}
