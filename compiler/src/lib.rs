// emc — Embedded Model Compiler
//
// Library root. A model is a DAG of typed nodes; maps package a model behind
// named inputs and one output; the compile pipeline refines, optimizes and
// emits one kernel per map.

pub mod archive;
pub mod compiled;
pub mod compiler;
pub mod compute;
pub mod dot;
pub mod emitter;
pub mod error;
pub mod id;
pub mod layout;
pub mod map;
pub mod model;
pub mod node;
pub mod nodes;
pub mod pass;
pub mod passes;
pub mod pipeline;
pub mod port;
pub mod transformer;
pub mod value;

pub use compiled::CompiledMap;
pub use compiler::MapCompilerOptions;
pub use error::{GraphError, Result};
pub use id::{NodeId, PortRef};
pub use layout::{DimensionOrder, MemoryShape, PortMemoryLayout, PortType};
pub use map::Map;
pub use model::Model;
pub use node::Node;
pub use port::{PortElements, PortRange};
pub use value::PortValue;
