// compute.rs — Port value storage for interpreted evaluation
//
// A `ComputeContext` holds one flat buffer per evaluated output port. Nodes
// read their inputs by gathering PortElements ranges out of it and publish
// each output with `set_output`. Values are exchanged as f64 and quantized to
// the port's element type on store.

use std::collections::HashMap;

use crate::error::{GraphError, Result};
use crate::id::PortRef;
use crate::layout::PortType;
use crate::port::PortElements;
use crate::value::PortValue;

#[derive(Debug, Default, Clone)]
pub struct ComputeContext {
    values: HashMap<PortRef, PortValue>,
}

impl ComputeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_output(&mut self, port: PortRef, value: PortValue) {
        self.values.insert(port, value);
    }

    /// Store f64 data as a buffer of `port_type`.
    pub fn set_output_f64(&mut self, port: PortRef, port_type: PortType, data: &[f64]) {
        self.values.insert(port, PortValue::from_f64(port_type, data));
    }

    pub fn output(&self, port: PortRef) -> Option<&PortValue> {
        self.values.get(&port)
    }

    /// Concatenate the selected elements, in order, as f64.
    pub fn gather(&self, elements: &PortElements) -> Result<Vec<f64>> {
        let mut out = Vec::with_capacity(elements.size());
        for range in elements.ranges() {
            let value = self
                .values
                .get(&range.port)
                .ok_or(GraphError::MissingValue { port: range.port })?;
            let data = value.to_f64_vec();
            let slice = data.get(range.start..range.end()).ok_or_else(|| {
                GraphError::Execution(format!(
                    "range {} exceeds the {} elements stored for {}",
                    range,
                    data.len(),
                    range.port
                ))
            })?;
            out.extend_from_slice(slice);
        }
        Ok(out)
    }

    /// Like `gather`, but keeps the element type of the selection.
    pub fn gather_value(&self, elements: &PortElements) -> Result<PortValue> {
        let data = self.gather(elements)?;
        Ok(PortValue::from_f64(elements.port_type(), &data))
    }
}
