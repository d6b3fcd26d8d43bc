// layout.rs — Port element types and memory layouts
//
// A `PortMemoryLayout` describes one port buffer: per physical dimension an
// active size, an allocated extent (the stride) and a leading offset, plus a
// `DimensionOrder` naming which logical dimension each physical dimension holds.
//
// Invariants: size, extent, offset and order all have the same rank, and
// `offset[d] + size[d] <= extent[d]` for every dimension. Layouts are
// immutable; changing one means inserting a ReorderDataNode.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

// ── Port element type ───────────────────────────────────────────────────────

/// Element kind carried by a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    Real32,
    Real64,
    Integer,
    Boolean,
}

impl PortType {
    pub fn name(self) -> &'static str {
        match self {
            PortType::Real32 => "real32",
            PortType::Real64 => "real64",
            PortType::Integer => "integer",
            PortType::Boolean => "boolean",
        }
    }

    /// C spelling used by the kernel printer.
    pub fn c_type(self) -> &'static str {
        match self {
            PortType::Real32 => "float",
            PortType::Real64 => "double",
            PortType::Integer => "int32_t",
            PortType::Boolean => "bool",
        }
    }

    pub fn is_real(self) -> bool {
        matches!(self, PortType::Real32 | PortType::Real64)
    }

    /// Round a computed value to what a buffer of this type can hold.
    pub fn quantize(self, value: f64) -> f64 {
        match self {
            PortType::Real32 => value as f32 as f64,
            PortType::Real64 => value,
            PortType::Integer => value as i32 as f64,
            PortType::Boolean => {
                if value != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Shapes and orders ───────────────────────────────────────────────────────

/// Ordered per-dimension sizes. Rank is the length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryShape(Vec<usize>);

impl MemoryShape {
    pub fn new(dims: Vec<usize>) -> Self {
        MemoryShape(dims)
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn num_elements(&self) -> usize {
        self.0.iter().product()
    }
}

impl From<Vec<usize>> for MemoryShape {
    fn from(dims: Vec<usize>) -> Self {
        MemoryShape(dims)
    }
}

impl fmt::Display for MemoryShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_list(f, &self.0)
    }
}

/// Permutation mapping physical dimension `p` to logical dimension `order[p]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct DimensionOrder(Vec<usize>);

impl DimensionOrder {
    /// Validate that `order` is a permutation of `0..order.len()`.
    pub fn new(order: Vec<usize>) -> Result<Self> {
        let mut seen = vec![false; order.len()];
        for &d in &order {
            if d >= order.len() || seen[d] {
                return Err(GraphError::Construction(format!(
                    "dimension order {:?} is not a permutation",
                    order
                )));
            }
            seen[d] = true;
        }
        Ok(DimensionOrder(order))
    }

    /// Row-major order `[0, 1, .., rank-1]`.
    pub fn canonical(rank: usize) -> Self {
        DimensionOrder((0..rank).collect())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn is_canonical(&self) -> bool {
        self.0.iter().enumerate().all(|(i, &d)| i == d)
    }

    /// Physical position holding logical dimension `logical`.
    pub fn physical_index(&self, logical: usize) -> Option<usize> {
        self.0.iter().position(|&d| d == logical)
    }
}

impl TryFrom<Vec<usize>> for DimensionOrder {
    type Error = GraphError;

    fn try_from(order: Vec<usize>) -> Result<Self> {
        DimensionOrder::new(order)
    }
}

impl From<DimensionOrder> for Vec<usize> {
    fn from(order: DimensionOrder) -> Self {
        order.0
    }
}

impl fmt::Display for DimensionOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_list(f, &self.0)
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[usize]) -> fmt::Result {
    write!(f, "[")?;
    for (i, v) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", v)?;
    }
    write!(f, "]")
}

// ── Memory layout ───────────────────────────────────────────────────────────

/// Shape, stride, offset and dimension order of one port buffer.
///
/// Deserialization goes through [`PortMemoryLayout::new`], so an archived
/// layout is held to the same rank and bounds checks as a constructed one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "LayoutFields")]
pub struct PortMemoryLayout {
    size: MemoryShape,
    extent: MemoryShape,
    offset: MemoryShape,
    order: DimensionOrder,
}

/// Unchecked wire form of a layout.
#[derive(Deserialize)]
struct LayoutFields {
    size: MemoryShape,
    extent: MemoryShape,
    offset: MemoryShape,
    order: DimensionOrder,
}

impl TryFrom<LayoutFields> for PortMemoryLayout {
    type Error = GraphError;

    fn try_from(fields: LayoutFields) -> Result<Self> {
        PortMemoryLayout::new(fields.size, fields.extent, fields.offset, fields.order)
    }
}

impl PortMemoryLayout {
    /// Contiguous row-major layout with no padding.
    pub fn contiguous(size: impl Into<MemoryShape>) -> Self {
        let size = size.into();
        let rank = size.rank();
        PortMemoryLayout {
            extent: size.clone(),
            offset: MemoryShape(vec![0; rank]),
            order: DimensionOrder::canonical(rank),
            size,
        }
    }

    /// Rank-1 contiguous layout of `len` elements.
    pub fn flat(len: usize) -> Self {
        PortMemoryLayout::contiguous(vec![len])
    }

    /// Fully specified layout; checks rank agreement and padding bounds.
    pub fn new(
        size: impl Into<MemoryShape>,
        extent: impl Into<MemoryShape>,
        offset: impl Into<MemoryShape>,
        order: DimensionOrder,
    ) -> Result<Self> {
        let (size, extent, offset) = (size.into(), extent.into(), offset.into());
        let rank = size.rank();
        if extent.rank() != rank || offset.rank() != rank || order.rank() != rank {
            return Err(GraphError::Construction(format!(
                "layout rank mismatch: size {}, extent {}, offset {}, order {}",
                size, extent, offset, order
            )));
        }
        for d in 0..rank {
            let end = offset.0[d].checked_add(size.0[d]);
            if end.map_or(true, |end| end > extent.0[d]) {
                return Err(GraphError::Construction(format!(
                    "layout dimension {}: offset {} + active size {} exceeds stride {}",
                    d, offset.0[d], size.0[d], extent.0[d]
                )));
            }
        }
        Ok(PortMemoryLayout {
            size,
            extent,
            offset,
            order,
        })
    }

    /// Layout of `size` with `padding` elements on both sides of the first
    /// `padded_dims` dimensions.
    pub fn padded(size: impl Into<MemoryShape>, padding: usize, padded_dims: usize) -> Result<Self> {
        let size = size.into();
        let rank = size.rank();
        let pad = |d: usize| if d < padded_dims { padding } else { 0 };
        let extent: Vec<usize> = (0..rank).map(|d| size.0[d] + 2 * pad(d)).collect();
        let offset: Vec<usize> = (0..rank).map(pad).collect();
        PortMemoryLayout::new(size, extent, offset, DimensionOrder::canonical(rank))
    }

    /// Same layout with a different logical dimension order.
    pub fn with_order(&self, order: DimensionOrder) -> Result<Self> {
        PortMemoryLayout::new(
            self.size.clone(),
            self.extent.clone(),
            self.offset.clone(),
            order,
        )
    }

    pub fn rank(&self) -> usize {
        self.size.rank()
    }

    pub fn active_size(&self, d: usize) -> usize {
        self.size.0[d]
    }

    pub fn stride(&self, d: usize) -> usize {
        self.extent.0[d]
    }

    pub fn offset(&self, d: usize) -> usize {
        self.offset.0[d]
    }

    pub fn active_sizes(&self) -> &[usize] {
        self.size.dims()
    }

    pub fn strides(&self) -> &[usize] {
        self.extent.dims()
    }

    pub fn offsets(&self) -> &[usize] {
        self.offset.dims()
    }

    pub fn logical_dimension_order(&self) -> &DimensionOrder {
        &self.order
    }

    /// Active size of logical dimension `logical`.
    pub fn logical_active_size(&self, logical: usize) -> Option<usize> {
        self.order.physical_index(logical).map(|p| self.size.0[p])
    }

    /// Flat-address multiplier for each physical dimension.
    pub fn cumulative_increment(&self) -> Vec<usize> {
        let rank = self.rank();
        let mut inc = vec![1; rank];
        for d in (0..rank.saturating_sub(1)).rev() {
            inc[d] = inc[d + 1] * self.extent.0[d + 1];
        }
        inc
    }

    /// Total allocated elements, padding included.
    pub fn memory_size(&self) -> usize {
        self.extent.num_elements()
    }

    pub fn num_active_elements(&self) -> usize {
        self.size.num_elements()
    }

    pub fn has_padding(&self) -> bool {
        self.size != self.extent
    }

    /// Flat offset of an active-region coordinate given in physical order.
    pub fn entry_offset(&self, coords: &[usize]) -> usize {
        let inc = self.cumulative_increment();
        coords
            .iter()
            .enumerate()
            .map(|(d, &c)| (c + self.offset.0[d]) * inc[d])
            .sum()
    }

    /// True when both layouts hold the same logical data, dimension by dimension.
    pub fn same_logical_extent(&self, other: &PortMemoryLayout) -> bool {
        self.rank() == other.rank()
            && (0..self.rank()).all(|l| self.logical_active_size(l) == other.logical_active_size(l))
    }
}

impl fmt::Display for PortMemoryLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "size {}", self.size)?;
        if self.has_padding() {
            write!(f, ", stride {}, offset {}", self.extent, self.offset)?;
        }
        if !self.order.is_canonical() {
            write!(f, ", order {}", self.order)?;
        }
        Ok(())
    }
}

/// Visit every coordinate of `sizes` in row-major order.
pub fn for_each_coordinate(sizes: &[usize], mut f: impl FnMut(&[usize])) {
    if sizes.iter().any(|&s| s == 0) {
        return;
    }
    let mut coords = vec![0; sizes.len()];
    loop {
        f(&coords);
        let mut d = sizes.len();
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            coords[d] += 1;
            if coords[d] < sizes[d] {
                break;
            }
            coords[d] = 0;
        }
    }
}
