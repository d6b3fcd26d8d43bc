// compiled.rs — Compiled map: emitted kernel plus its call contract

use std::fmt;

use crate::emitter::Kernel;
use crate::error::{GraphError, Result};
use crate::layout::{PortMemoryLayout, PortType};
use crate::map::Map;
use crate::pipeline::{CompilationState, Provenance};
use crate::value::PortValue;

/// One kernel argument: name, element type and the exact layout callers must
/// supply.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelInput {
    pub name: String,
    pub port_type: PortType,
    pub layout: PortMemoryLayout,
}

#[derive(Debug, Clone)]
pub struct CompiledMap {
    map: Map,
    kernel: Kernel,
    inputs: Vec<KernelInput>,
    provenance: Provenance,
}

impl CompiledMap {
    /// Package the artifacts of a pipeline run that reached `Emit`.
    pub fn from_state(state: CompilationState) -> Result<CompiledMap> {
        let map = state
            .optimized
            .or(state.refined)
            .unwrap_or(state.map);
        let kernel = state
            .kernel
            .ok_or_else(|| GraphError::InvalidArgument("pipeline stopped before emitting a kernel".into()))?;
        let provenance = state
            .provenance
            .ok_or_else(|| GraphError::InvalidArgument("pipeline produced no provenance".into()))?;
        let inputs = (0..map.inputs().len())
            .map(|i| {
                Ok(KernelInput {
                    name: map.inputs()[i].name.clone(),
                    port_type: map.input_type(i)?,
                    layout: map.input_layout(i)?.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CompiledMap {
            map,
            kernel,
            inputs,
            provenance,
        })
    }

    /// The refined and optimized map the kernel was emitted from.
    pub fn map(&self) -> &Map {
        &self.map
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn function_name(&self) -> &str {
        self.kernel.name()
    }

    pub fn inputs(&self) -> &[KernelInput] {
        &self.inputs
    }

    pub fn output_type(&self) -> PortType {
        self.map.output_type()
    }

    pub fn output_size(&self) -> usize {
        self.map.output_size()
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// C source of the kernel.
    pub fn source(&self) -> String {
        self.kernel.to_string()
    }

    /// Run the kernel: one flat buffer per input, in declaration order.
    pub fn compute(&self, inputs: &[PortValue]) -> Result<PortValue> {
        self.kernel.execute(inputs)
    }
}

impl fmt::Display for CompiledMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kernel)
    }
}
