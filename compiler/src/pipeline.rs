// pipeline.rs — Compile stages and their orchestration
//
// Compiling a map runs four stages in dependency order: refine to a fixed
// point, run the selected optimization passes, validate layouts, emit the
// kernel. Each stage stores its artifact in `CompilationState` and reports its
// duration; the first failing stage aborts the run and nothing downstream of
// it is produced.
//
// Preconditions: `state.map` is a well-formed map.
// Postconditions: artifacts for every stage in `required_stages(terminal)`
//   are populated, and `provenance` is set once `Emit` has run.
// Failure modes: any `GraphError` raised by a stage.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::archive::canonical_json;
use crate::compiler::{compile_model, MapCompilerOptions};
use crate::emitter::Kernel;
use crate::error::Result;
use crate::map::Map;
use crate::pass::PassRegistry;

// ── Stage identifiers ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Refine,
    Optimize,
    ValidateLayouts,
    Emit,
}

/// Static metadata about a stage.
pub struct StageDescriptor {
    pub name: &'static str,
    /// Stages whose artifacts this stage consumes.
    pub inputs: &'static [Stage],
    /// What holds once the stage completes.
    pub invariants: &'static str,
}

pub fn descriptor(stage: Stage) -> StageDescriptor {
    match stage {
        Stage::Refine => StageDescriptor {
            name: "refine",
            inputs: &[],
            invariants: "no reachable node is refinable",
        },
        Stage::Optimize => StageDescriptor {
            name: "optimize",
            inputs: &[Stage::Refine],
            invariants: "no source or sink nodes remain",
        },
        Stage::ValidateLayouts => StageDescriptor {
            name: "validate_layouts",
            inputs: &[Stage::Optimize],
            invariants: "every consumer accepts its producer's layout",
        },
        Stage::Emit => StageDescriptor {
            name: "emit",
            inputs: &[Stage::ValidateLayouts],
            invariants: "one kernel computing the map output",
        },
    }
}

pub const ALL_STAGES: [Stage; 4] = [
    Stage::Refine,
    Stage::Optimize,
    Stage::ValidateLayouts,
    Stage::Emit,
];

/// Minimal ordered set of stages needed to produce `terminal`.
pub fn required_stages(terminal: Stage) -> Vec<Stage> {
    fn visit(stage: Stage, seen: &mut HashSet<Stage>, order: &mut Vec<Stage>) {
        if !seen.insert(stage) {
            return;
        }
        for &dep in descriptor(stage).inputs {
            visit(dep, seen, order);
        }
        order.push(stage);
    }
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut seen, &mut order);
    order
}

// ── Provenance ─────────────────────────────────────────────────────────────

/// Fingerprint of a compiled map.
///
/// `model_hash`: SHA-256 of the compact archive of the model that was emitted.
/// `kernel_hash`: SHA-256 of the kernel's C source.
/// `compiler_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provenance {
    #[serde(serialize_with = "hex_field")]
    pub model_hash: [u8; 32],
    #[serde(serialize_with = "hex_field")]
    pub kernel_hash: [u8; 32],
    pub compiler_version: &'static str,
}

fn hex_field<S: serde::Serializer>(bytes: &[u8; 32], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&bytes_to_hex(bytes))
}

impl Provenance {
    pub fn model_hash_hex(&self) -> String {
        bytes_to_hex(&self.model_hash)
    }

    pub fn kernel_hash_hex(&self) -> String {
        bytes_to_hex(&self.kernel_hash)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(64);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn sha256(text: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

pub fn compute_provenance(map: &Map, kernel: &Kernel) -> Result<Provenance> {
    Ok(Provenance {
        model_hash: sha256(&canonical_json(map.model())?),
        kernel_hash: sha256(&kernel.to_string()),
        compiler_version: env!("CARGO_PKG_VERSION"),
    })
}

// ── Compilation state ──────────────────────────────────────────────────────

pub struct CompilationState {
    pub map: Map,
    pub refined: Option<Map>,
    pub optimized: Option<Map>,
    pub kernel: Option<Kernel>,
    pub provenance: Option<Provenance>,
    pub timings: Vec<(Stage, Duration)>,
}

impl CompilationState {
    pub fn new(map: Map) -> Self {
        CompilationState {
            map,
            refined: None,
            optimized: None,
            kernel: None,
            provenance: None,
            timings: Vec::new(),
        }
    }

    /// Most rewritten map produced so far.
    pub fn current_map(&self) -> &Map {
        self.optimized
            .as_ref()
            .or(self.refined.as_ref())
            .unwrap_or(&self.map)
    }
}

fn finish_stage(state: &mut CompilationState, stage: Stage, elapsed: Duration) {
    debug!(
        stage = descriptor(stage).name,
        "{} complete, {:.1}ms",
        descriptor(stage).name,
        elapsed.as_secs_f64() * 1000.0
    );
    state.timings.push((stage, elapsed));
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the stages needed for `terminal`.
pub fn run_pipeline(
    state: &mut CompilationState,
    terminal: Stage,
    options: &MapCompilerOptions,
    registry: &PassRegistry,
) -> Result<()> {
    let started = Instant::now();
    for stage in required_stages(terminal) {
        let t = Instant::now();
        match stage {
            Stage::Refine => {
                let refined = state.map.refine(options.max_refinement_iterations)?;
                state.refined = Some(refined);
            }
            Stage::Optimize => {
                let optimized = state.current_map().optimize(registry, options)?;
                state.optimized = Some(optimized);
            }
            Stage::ValidateLayouts => {
                state.current_map().model().validate_layouts()?;
            }
            Stage::Emit => {
                let (kernel, provenance) = {
                    let map = state.current_map();
                    let kernel = compile_model(map.model(), map.inputs(), map.output(), options)?;
                    let provenance = compute_provenance(map, &kernel)?;
                    (kernel, provenance)
                };
                state.provenance = Some(provenance);
                state.kernel = Some(kernel);
            }
        }
        finish_stage(state, stage, t.elapsed());
    }
    info!(
        function = options.function_name.as_str(),
        stages = state.timings.len(),
        "pipeline complete, {:.1}ms",
        started.elapsed().as_secs_f64() * 1000.0
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_requires_every_stage_in_order() {
        assert_eq!(required_stages(Stage::Emit), ALL_STAGES.to_vec());
        assert_eq!(required_stages(Stage::Refine), vec![Stage::Refine]);
    }

    #[test]
    fn descriptors_only_name_earlier_stages() {
        for (i, &stage) in ALL_STAGES.iter().enumerate() {
            for dep in descriptor(stage).inputs {
                assert!(ALL_STAGES[..i].contains(dep), "{:?} -> {:?}", stage, dep);
            }
        }
    }

    #[test]
    fn hex_is_lowercase_and_fixed_width() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        bytes[31] = 0x01;
        let hex = bytes_to_hex(&bytes);
        assert_eq!(hex.len(), 64);
        assert!(hex.starts_with("ab00"));
        assert!(hex.ends_with("01"));
    }
}
