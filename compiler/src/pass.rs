// pass.rs — Optimization pass contract, registry and optimizer driver
//
// A pass is a stateless strategy applied node by node during one transformer
// walk. It either claims the node (adds replacements and maps every output)
// or hands it to `Node::copy`, so unmatched nodes always pass through.
//
// The registry is an explicit value: built once through `PassRegistryBuilder`
// (or `PassRegistry::standard`) and passed by reference to whoever optimizes.
// Nothing registers lazily and nothing reads ambient global state.
//
// Preconditions: pass names are unique within one registry.
// Postconditions: `ModelOptimizer::optimize` returns the composed remap table
//   from the input model to the final model.
// Failure modes: `Construction` on duplicate registration; any error raised by
//   a pass aborts the optimization.

use std::fmt;
use std::time::Instant;

use tracing::{debug, info};

use crate::compiler::MapCompilerOptions;
use crate::error::{GraphError, Result};
use crate::id::NodeId;
use crate::model::Model;
use crate::node::Node;
use crate::passes::{FoldConstantOperationsPass, RemoveIdentityReorderPass, ReplaceSourceAndSinkNodesPass};
use crate::transformer::{transform_model, ModelTransformer, TransformedModel};

// ── Pass contract ──────────────────────────────────────────────────────────

/// What a pass sees of the walk in progress.
pub struct OptimizerContext<'a> {
    source: &'a Model,
    transformer: &'a mut ModelTransformer,
}

impl<'a> OptimizerContext<'a> {
    pub fn new(source: &'a Model, transformer: &'a mut ModelTransformer) -> Self {
        OptimizerContext { source, transformer }
    }

    /// The model being walked.
    pub fn source(&self) -> &'a Model {
        self.source
    }

    pub fn transformer(&mut self) -> &mut ModelTransformer {
        &mut *self.transformer
    }
}

pub trait OptimizationPass {
    fn name(&self) -> &'static str;

    /// Rewrite `node` or copy it through. Must map every output of `node`
    /// exactly once either way.
    fn optimize_node(
        &self,
        node: &Node,
        id: NodeId,
        options: &MapCompilerOptions,
        ctx: &mut OptimizerContext<'_>,
    ) -> Result<()>;
}

// ── Registry ───────────────────────────────────────────────────────────────

/// Registration entry: when a pass applies, and how to build it.
#[derive(Clone, Copy)]
pub struct PassInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub applies: fn(&MapCompilerOptions) -> bool,
    pub create: fn() -> Box<dyn OptimizationPass>,
}

impl fmt::Debug for PassInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassInfo")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct PassRegistryBuilder {
    passes: Vec<PassInfo>,
}

impl PassRegistryBuilder {
    pub fn register(mut self, info: PassInfo) -> Result<Self> {
        if self.passes.iter().any(|p| p.name == info.name) {
            return Err(GraphError::Construction(format!(
                "optimization pass '{}' is already registered",
                info.name
            )));
        }
        self.passes.push(info);
        Ok(self)
    }

    pub fn build(self) -> PassRegistry {
        PassRegistry {
            passes: self.passes,
        }
    }
}

/// Read-only, ordered set of registered passes.
#[derive(Debug, Clone, Default)]
pub struct PassRegistry {
    passes: Vec<PassInfo>,
}

fn always(_: &MapCompilerOptions) -> bool {
    true
}

fn when_optimizing(options: &MapCompilerOptions) -> bool {
    options.optimize
}

fn replace_source_and_sink_nodes() -> Box<dyn OptimizationPass> {
    Box::new(ReplaceSourceAndSinkNodesPass)
}

fn remove_identity_reorder() -> Box<dyn OptimizationPass> {
    Box::new(RemoveIdentityReorderPass)
}

fn fold_constant_operations() -> Box<dyn OptimizationPass> {
    Box::new(FoldConstantOperationsPass)
}

/// Built-in passes, in run order.
pub const STANDARD_PASSES: [PassInfo; 3] = [
    PassInfo {
        name: "replace_source_and_sink_nodes",
        description: "turn callback sources and sinks into plain map inputs and outputs",
        applies: always,
        create: replace_source_and_sink_nodes,
    },
    PassInfo {
        name: "remove_identity_reorder",
        description: "drop reorder nodes whose input and output layouts are equal",
        applies: when_optimizing,
        create: remove_identity_reorder,
    },
    PassInfo {
        name: "fold_constant_operations",
        description: "evaluate operations whose inputs are all constants",
        applies: when_optimizing,
        create: fold_constant_operations,
    },
];

impl PassRegistry {
    pub fn builder() -> PassRegistryBuilder {
        PassRegistryBuilder::default()
    }

    /// Registry holding the built-in passes.
    pub fn standard() -> PassRegistry {
        PassRegistry {
            passes: STANDARD_PASSES.to_vec(),
        }
    }

    pub fn passes(&self) -> &[PassInfo] {
        &self.passes
    }

    pub fn lookup(&self, name: &str) -> Option<&PassInfo> {
        self.passes.iter().find(|p| p.name == name)
    }

    /// Passes whose predicate accepts `options`, in registration order.
    pub fn selected(&self, options: &MapCompilerOptions) -> Vec<&PassInfo> {
        self.passes.iter().filter(|p| (p.applies)(options)).collect()
    }
}

// ── Optimizer ──────────────────────────────────────────────────────────────

/// Runs the selected passes as independent transformer walks.
pub struct ModelOptimizer {
    passes: Vec<Box<dyn OptimizationPass>>,
}

impl ModelOptimizer {
    pub fn new(registry: &PassRegistry, options: &MapCompilerOptions) -> Self {
        ModelOptimizer {
            passes: registry
                .selected(options)
                .into_iter()
                .map(|info| (info.create)())
                .collect(),
        }
    }

    pub fn with_passes(passes: Vec<Box<dyn OptimizationPass>>) -> Self {
        ModelOptimizer { passes }
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    pub fn optimize(&self, model: &Model, options: &MapCompilerOptions) -> Result<TransformedModel> {
        let mut current = TransformedModel::identity(model.clone())?;
        for pass in &self.passes {
            let started = Instant::now();
            let source = &current.model;
            let next = transform_model(source, |node, id, t| {
                let mut ctx = OptimizerContext::new(source, t);
                pass.optimize_node(node, id, options, &mut ctx)
            })?;
            debug!(
                pass = pass.name(),
                before = current.model.len(),
                after = next.model.len(),
                "{} complete, {:.1}ms",
                pass.name(),
                started.elapsed().as_secs_f64() * 1000.0
            );
            current = current.compose(next)?;
        }
        info!(passes = self.passes.len(), nodes = current.model.len(), "optimization complete");
        Ok(current)
    }
}
