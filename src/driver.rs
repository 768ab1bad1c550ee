// This module orchestrates one compilation run. The phases run once each in a fixed order: a
// probe pass measures how much arena the reference engine needs, a fresh arena of exactly that
// size backs the recorded pass, the recorded trace is turned into allocation units, the chosen
// planner places them, the plan is verified against the units, and the code generator emits the
// translation unit. The probe arena is owned by the probe function and freed before the real
// arena exists, so no address from the first pass can be mistaken for one from the second. All
// region bookkeeping lives in the AddressContext built for the run; nothing is process-wide.

//! Compilation driver.

use std::fs;
use std::path::Path;

use bumpalo::Bump;

use crate::codegen::CodeGenerator;
use crate::config::CompileOptions;
use crate::core::{
    align_up, AddressContext, CompilationSession, CompileError, CompileResult, Region, SessionStats,
};
use crate::engine::{
    BuiltinOpResolver, HostArena, HostInterpreter, NoHook, OpResolver, ReferenceEngine,
};
use crate::model::Model;
use crate::recorder::ExecutionRecorder;
use crate::report::MemoryMap;

/// Everything a compilation run produces.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    /// The generated translation unit.
    pub source: String,
    /// Declared size of the generated arena.
    pub arena_size: usize,
    pub tensor_count: usize,
    /// Kernel name of every node, in execution order.
    pub operations: Vec<String>,
    /// One line per planned unit.
    pub plan_description: String,
    pub memory_map: MemoryMap,
    pub stats: SessionStats,
}

/// Measure the arena the reference engine needs for `model`.
///
/// Runs one allocation pass in a private arena of `probe_bytes` and returns
/// the bytes it used, rounded up to `alignment`.
pub fn probe_arena_size(
    model: &Model,
    resolver: &dyn OpResolver,
    probe_bytes: usize,
    alignment: usize,
) -> CompileResult<usize> {
    let mut arena = HostArena::new(probe_bytes);
    let used = {
        let mut engine = HostInterpreter::new(model, resolver, arena.as_mut_slice())?;
        engine.allocate_tensors(&mut NoHook)?;
        engine.arena_used_bytes()
    };
    drop(arena);

    let size = align_up(used, alignment);
    log::info!("probe pass used {used} bytes, real arena gets {size}");
    Ok(size)
}

/// Runs the whole pipeline for one model at a time.
pub struct Compiler<R: OpResolver = BuiltinOpResolver> {
    options: CompileOptions,
    resolver: R,
}

impl Compiler<BuiltinOpResolver> {
    pub fn new(options: CompileOptions) -> Self {
        Self::with_resolver(options, BuiltinOpResolver::new())
    }
}

impl<R: OpResolver> Compiler<R> {
    pub fn with_resolver(options: CompileOptions, resolver: R) -> Self {
        Self { options, resolver }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Compile a decoded model into a generated program.
    pub fn compile(&self, model: &Model) -> CompileResult<CompileOutput> {
        self.options.validate()?;
        let options = &self.options;

        let arena_bytes = probe_arena_size(
            model,
            &self.resolver,
            options.probe_arena_bytes,
            options.alignment,
        )?;

        let mut arena = HostArena::new(arena_bytes);
        let ctx = AddressContext::new(arena.region(), Region::of_slice(model.bytes()));
        let mut engine = HostInterpreter::new(model, &self.resolver, arena.as_mut_slice())?;

        let bump = Bump::new();
        let session = CompilationSession::new(&bump);
        let trace = ExecutionRecorder::new(&session).record(&mut engine, &ctx)?;
        let operations: Vec<String> =
            trace.nodes.iter().map(|node| node.kernel_name.to_string()).collect();
        for (i, name) in operations.iter().enumerate() {
            log::debug!("operation {i}: {name}");
        }

        let units = trace.analyze_lifetimes(options.alignment)?;
        let planner = options.planner.build(options.search_budget);
        let plan = planner.plan(&units);
        plan.verify(&units)?;
        session.record_plan(planner.name(), plan.planned_count(), plan.arena_size());
        log::info!(
            "{} planner placed {} units in {} bytes",
            planner.name(),
            plan.planned_count(),
            plan.arena_size()
        );

        let program = CodeGenerator::new()
            .timestamp(options.timestamp)
            .alignment(options.alignment)
            .generate(model.bytes(), &trace, &units, &plan)?;
        session.record_program(program.registrations, program.arena_size);

        let stats = session.stats();
        log::info!("{stats}");

        Ok(CompileOutput {
            memory_map: MemoryMap::from_buffers(&program.buffers),
            plan_description: plan.describe(&units),
            arena_size: program.arena_size,
            tensor_count: trace.tensors.len(),
            source: program.source,
            operations,
            stats,
        })
    }

    /// Read a model file, compile it and write the generated source to `output`.
    pub fn compile_file(&self, input: &Path, output: &Path) -> CompileResult<CompileOutput> {
        let bytes = fs::read(input).map_err(|err| CompileError::io(input, err))?;
        let model = Model::from_bytes(bytes)?;
        log::info!(
            "loaded {}: schema version {}, {} tensors, {} operators",
            input.display(),
            model.version(),
            model.subgraph().tensors.len(),
            model.subgraph().operators.len()
        );

        let result = self.compile(&model)?;
        fs::write(output, &result.source).map_err(|err| CompileError::io(output, err))?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BuiltinOperator, ModelBuilder, OperatorSpec, TensorType};
    use crate::planner::PlannerKind;

    fn conv_model() -> Model {
        let mut builder = ModelBuilder::new();
        let input = builder.add_tensor(TensorType::Float32, &[1, 8, 8, 3]);
        let filter = builder.add_constant(TensorType::Float32, &[4, 3, 3, 3], vec![0u8; 432]);
        let conv = builder.add_tensor(TensorType::Float32, &[1, 6, 6, 4]);
        let output = builder.add_tensor(TensorType::Float32, &[1, 6, 6, 4]);
        builder.set_inputs(&[input]);
        builder.set_outputs(&[output]);
        builder.add_operator(OperatorSpec::new(
            BuiltinOperator::CONV_2D,
            1,
            &[input, filter, -1],
            &[conv],
        ));
        builder.add_operator(OperatorSpec::new(BuiltinOperator::RELU, 1, &[conv], &[output]));
        Model::from_bytes(builder.build()).unwrap()
    }

    #[test]
    fn test_probe_is_aligned() {
        let model = conv_model();
        let resolver = BuiltinOpResolver::new();
        let size = probe_arena_size(&model, &resolver, 64 * 1024, 16).unwrap();
        assert_eq!(size % 16, 0);
        assert!(size >= 768 + 576);
    }

    #[test]
    fn test_probe_reports_small_arena() {
        let model = conv_model();
        let resolver = BuiltinOpResolver::new();
        let err = probe_arena_size(&model, &resolver, 128, 16).unwrap_err();
        assert!(matches!(err, CompileError::Engine(_)));
        assert!(!err.is_internal());
    }

    #[test]
    fn test_compile_conv_model() {
        let _ = env_logger::builder().is_test(true).try_init();
        let model = conv_model();
        let options = CompileOptions {
            timestamp: false,
            ..CompileOptions::default()
        };
        let output = Compiler::new(options).compile(&model).unwrap();

        assert_eq!(output.tensor_count, 4);
        assert_eq!(output.operations, vec!["CONV_2D", "RELU"]);
        assert_eq!(output.stats.scratch_buffers, 1);
        assert_eq!(output.stats.planner, "greedy");
        assert!(output.arena_size >= output.stats.planned_bytes);
        assert!(output.source.contains("g_scratchBuf[1]"));
        assert!(output
            .source
            .contains(&format!("constexpr int kTensorArenaSize = {};", output.arena_size)));
        assert!(output.plan_description.contains("scratch buffer 0"));
        assert!(output.memory_map.render().contains("scratch 0"));
    }

    #[test]
    fn test_planners_agree_on_validity() {
        let model = conv_model();
        let greedy = Compiler::new(CompileOptions {
            timestamp: false,
            ..CompileOptions::default()
        })
        .compile(&model)
        .unwrap();
        let optimal = Compiler::new(CompileOptions {
            planner: PlannerKind::Optimal,
            timestamp: false,
            ..CompileOptions::default()
        })
        .compile(&model)
        .unwrap();
        assert_eq!(optimal.stats.planner, "optimal");
        assert!(optimal.stats.planned_bytes <= greedy.stats.planned_bytes);
    }

    #[test]
    fn test_invalid_options() {
        let model = conv_model();
        let options = CompileOptions {
            alignment: 3,
            ..CompileOptions::default()
        };
        let err = Compiler::new(options).compile(&model).unwrap_err();
        assert!(matches!(err, CompileError::Config(_)));
    }
}
