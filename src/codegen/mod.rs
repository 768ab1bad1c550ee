// This module turns a recorded reference run plus a memory plan into the generated program. The
// Setup routine is straight-line code: it fills the persistent and scratch buffer tables with
// relocated arena addresses, materializes every tensor descriptor (data pointer, type, size,
// allocation kind, shape pointer, quantization block) and every node descriptor (operand arrays
// inside the constant model data, a deep copy of the builtin parameter struct, custom data,
// user data replayed from the persistent buffer table), and assigns the de-duplicated
// registrations. Eval calls prepare (where the kernel has one) and invoke for each node in
// recorded order. Apart from the optional timestamp line the output depends only on its inputs.

//! Code generation.

pub mod layout;
pub mod registrations;
pub mod template;

pub use layout::{ArenaLayout, RetainedSpan};
pub use registrations::{Registration, RegistrationTable};

use std::fmt::Write;

use crate::core::{AddressRecord, AllocationUnit, CompileResult, UnitId, BUFFER_ALIGNMENT};
use crate::planner::MemoryPlan;
use crate::recorder::{ExecutionTrace, RecordedQuantization};
use crate::model::TensorType;
use template::{byte_array, float_literal, ProgramParts};

/// Size of the runtime's `TfLiteIntArray` / `TfLiteFloatArray` with `n` entries.
const fn runtime_array_bytes(n: usize) -> usize {
    4 + 4 * n
}

/// A buffer as placed in the generated program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedBuffer {
    pub tag: String,
    pub address: AddressRecord,
    pub bytes: usize,
}

/// Output of one generation run.
#[derive(Debug, Clone)]
pub struct GeneratedProgram {
    pub source: String,
    /// Declared size of `tensor_arena`.
    pub arena_size: usize,
    pub registrations: usize,
    /// Every tensor, persistent and scratch buffer with its target address.
    pub buffers: Vec<PlacedBuffer>,
}

/// Emits the translation unit.
#[derive(Debug, Clone, Copy)]
pub struct CodeGenerator {
    timestamp: bool,
    alignment: usize,
}

impl Default for CodeGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeGenerator {
    pub fn new() -> Self {
        Self {
            timestamp: true,
            alignment: BUFFER_ALIGNMENT,
        }
    }

    /// Whether to emit the generation timestamp line.
    pub fn timestamp(mut self, enabled: bool) -> Self {
        self.timestamp = enabled;
        self
    }

    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn generate(
        &self,
        model_data: &[u8],
        trace: &ExecutionTrace<'_>,
        units: &[AllocationUnit],
        plan: &MemoryPlan,
    ) -> CompileResult<GeneratedProgram> {
        let layout = ArenaLayout::new(plan, units, trace, self.alignment);
        let registrations = RegistrationTable::build(trace.nodes);
        let mut emitter = Emitter {
            trace,
            layout: &layout,
            setup: String::new(),
            eval: String::new(),
            quants: 0,
            int_array_bytes: 0,
            float_array_bytes: 0,
            buffers: Vec::new(),
        };

        emitter.buffer_tables()?;
        emitter.tensors(units)?;
        emitter.nodes(&registrations)?;
        emitter.registrations(&registrations)?;
        emitter.eval(&registrations)?;

        let parts = ProgramParts {
            timestamp: if self.timestamp { template::timestamp_line() } else { None },
            model_data,
            arena_size: layout.arena_size(),
            registrations: registrations.len(),
            nodes: trace.nodes.len(),
            tensors: trace.tensors.len(),
            quants: emitter.quants,
            int_array_bytes: emitter.int_array_bytes,
            float_array_bytes: emitter.float_array_bytes,
            persistent_buffers: trace.persistent.len(),
            init_buffers: trace.init_buffer_count(),
            scratch_buffers: trace.scratch.len(),
            setup: emitter.setup,
            eval: emitter.eval,
            input_tensor: first_tensor(trace.graph_inputs),
            output_tensor: first_tensor(trace.graph_outputs),
        };
        let source = template::render(&parts)?;
        log::info!(
            "generated {} bytes of source, arena {} bytes, {} registrations",
            source.len(),
            layout.arena_size(),
            registrations.len()
        );

        Ok(GeneratedProgram {
            source,
            arena_size: layout.arena_size(),
            registrations: registrations.len(),
            buffers: emitter.buffers,
        })
    }
}

fn first_tensor(indices: &[i32]) -> Option<usize> {
    indices.first().and_then(|&index| usize::try_from(index).ok())
}

struct Emitter<'t, 'l> {
    trace: &'t ExecutionTrace<'t>,
    layout: &'l ArenaLayout<'l>,
    setup: String,
    eval: String,
    quants: usize,
    int_array_bytes: usize,
    float_array_bytes: usize,
    buffers: Vec<PlacedBuffer>,
}

impl Emitter<'_, '_> {
    fn buffer_tables(&mut self) -> CompileResult<()> {
        if !self.trace.persistent.is_empty() {
            self.setup.push_str("  // Persistent buffers, in request order.\n");
        }
        for (k, buffer) in self.trace.persistent.iter().enumerate() {
            let address = self.layout.relocate(buffer.address)?;
            writeln!(
                self.setup,
                "  g_persistentBuf[{k}] = (void*){address}; // node {}, {} bytes",
                buffer.node_index, buffer.bytes
            )?;
            self.buffers.push(PlacedBuffer {
                tag: format!("persistent {k}"),
                address,
                bytes: buffer.bytes,
            });
        }

        if !self.trace.scratch.is_empty() {
            self.setup.push_str("  // Scratch buffers.\n");
        }
        for (k, buffer) in self.trace.scratch.iter().enumerate() {
            let address = self.layout.scratch_data(k)?;
            writeln!(
                self.setup,
                "  g_scratchBuf[{k}] = (void*){address}; // node {}, {} bytes",
                buffer.node_index, buffer.bytes
            )?;
            self.buffers.push(PlacedBuffer {
                tag: format!("scratch {k}"),
                address,
                bytes: buffer.bytes,
            });
        }
        if !self.trace.persistent.is_empty() || !self.trace.scratch.is_empty() {
            self.setup.push('\n');
        }
        Ok(())
    }

    fn tensors(&mut self, units: &[AllocationUnit]) -> CompileResult<()> {
        let trace = self.trace;
        self.setup.push_str("  // Setup tensors.\n");
        writeln!(self.setup, "  g_ctx.tensors_size = {};", trace.tensors.len())?;
        self.setup.push_str("  g_ctx.tensors = g_tensors;\n");

        for (i, tensor) in trace.tensors.iter().enumerate() {
            let data = self.layout.tensor_data(i, tensor.data)?;
            let (_, type_name) = tensor.tensor_type.runtime_type();
            let t = format!("  g_tensors[{i}]");
            writeln!(self.setup, "{t}.data.data = (void*){data};")?;
            writeln!(self.setup, "{t}.type = {type_name};")?;
            writeln!(self.setup, "{t}.is_variable = {};", tensor.is_variable)?;
            writeln!(self.setup, "{t}.allocation_type = {};", tensor.allocation.runtime_name())?;
            writeln!(self.setup, "{t}.bytes = {};", tensor.bytes)?;
            writeln!(self.setup, "{t}.dims = (TfLiteIntArray*){};", tensor.dims)?;

            if let Some(quant) = tensor.quantization.filter(|q| q.channels() > 0) {
                self.quantization(&t, &quant)?;
            }
            if tensor.is_variable && !data.is_null() {
                let fill = match (tensor.tensor_type, tensor.quantization) {
                    (TensorType::Int8, Some(quant)) if quant.channels() > 0 => quant.zero_points[0],
                    _ => 0,
                };
                writeln!(self.setup, "  memset((void*){data}, {fill}, {});", tensor.bytes)?;
            }

            let planned = units
                .get(i)
                .is_some_and(|unit| unit.id == UnitId::Tensor(i) && unit.needs_allocation);
            if planned || tensor.is_variable || matches!(data, AddressRecord::Const(_)) {
                self.buffers.push(PlacedBuffer {
                    tag: format!("tensor {i}"),
                    address: data,
                    bytes: tensor.bytes,
                });
            }
        }
        self.setup.push('\n');
        Ok(())
    }

    fn quantization(&mut self, t: &str, quant: &RecordedQuantization<'_>) -> CompileResult<()> {
        let channels = quant.channels();
        writeln!(self.setup, "{t}.params.scale = {};", float_literal(quant.scales[0]))?;
        writeln!(self.setup, "{t}.params.zero_point = {};", quant.zero_points[0])?;

        let q = format!("  g_quants[{}]", self.quants);
        self.quants += 1;
        writeln!(
            self.setup,
            "{q}.zero_point = (TfLiteIntArray*)&g_intArrayBuf[{}];",
            self.int_array_bytes
        )?;
        self.int_array_bytes += runtime_array_bytes(channels);
        writeln!(
            self.setup,
            "{q}.scale = (TfLiteFloatArray*)&g_floatArrayBuf[{}];",
            self.float_array_bytes
        )?;
        self.float_array_bytes += runtime_array_bytes(channels);
        writeln!(self.setup, "{q}.zero_point->size = {channels};")?;
        writeln!(self.setup, "{q}.scale->size = {channels};")?;
        for c in 0..channels {
            writeln!(self.setup, "{q}.zero_point->data[{c}] = {};", quant.zero_points[c])?;
            writeln!(self.setup, "{q}.scale->data[{c}] = {};", float_literal(quant.scales[c]))?;
        }
        writeln!(self.setup, "{q}.quantized_dimension = {};", quant.quantized_dimension)?;
        writeln!(
            self.setup,
            "{t}.quantization = {{kTfLiteAffineQuantization, &{}}};",
            q.trim_start()
        )?;
        Ok(())
    }

    fn nodes(&mut self, registrations: &RegistrationTable<'_>) -> CompileResult<()> {
        let trace = self.trace;
        self.setup.push_str("  // Setup nodes.\n");
        for (i, node) in trace.nodes.iter().enumerate() {
            log::debug!(
                "node {i}: {} v{} -> registration {}",
                node.kernel_name,
                node.version,
                registrations.slot(i)
            );
            let user_data = match trace.persistent_index(node.user_data) {
                Some(k) => format!("g_persistentBuf[{k}]"),
                None => self.layout.relocate(node.user_data)?.to_expression(),
            };
            self.setup.push_str("  {\n");
            writeln!(self.setup, "    TfLiteNode &node = g_node[{i}];")?;
            writeln!(self.setup, "    node.inputs = (TfLiteIntArray*){};", node.inputs_addr)?;
            writeln!(self.setup, "    node.outputs = (TfLiteIntArray*){};", node.outputs_addr)?;
            self.setup.push_str("    node.temporaries = nullptr;\n");
            writeln!(self.setup, "    node.user_data = {user_data};")?;
            if node.builtin_data.is_empty() {
                self.setup.push_str("    node.builtin_data = nullptr;\n");
            } else {
                writeln!(
                    self.setup,
                    "    static uint8_t builtin_data[] __attribute__((aligned(8))) = {};",
                    byte_array(node.builtin_data).replace('\n', "\n    ")
                )?;
                self.setup.push_str("    node.builtin_data = builtin_data;\n");
            }
            writeln!(self.setup, "    node.custom_initial_data = {};", node.custom_data)?;
            writeln!(self.setup, "    node.custom_initial_data_size = {};", node.custom_data_len)?;
            self.setup.push_str("    node.delegate = nullptr;\n");
            self.setup.push_str("  }\n");
        }
        self.setup.push('\n');
        Ok(())
    }

    fn registrations(&mut self, registrations: &RegistrationTable<'_>) -> CompileResult<()> {
        for (slot, reg) in registrations.entries().iter().enumerate() {
            writeln!(
                self.setup,
                "  g_regOp[{slot}] = tflite::ops::micro::Register_{}();",
                reg.name
            )?;
        }
        Ok(())
    }

    fn eval(&mut self, registrations: &RegistrationTable<'_>) -> CompileResult<()> {
        for (i, node) in self.trace.nodes.iter().enumerate() {
            let slot = registrations.slot(i);
            if node.has_prepare {
                writeln!(self.eval, "  g_regOp[{slot}]->prepare(&g_ctx, &g_node[{i}]);")?;
            }
            writeln!(self.eval, "  g_regOp[{slot}]->invoke(&g_ctx, &g_node[{i}]);")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AddressContext, CompilationSession, Region};
    use crate::engine::{BuiltinOpResolver, HostArena, HostInterpreter};
    use crate::model::{BuiltinOperator, Model, ModelBuilder, OperatorSpec};
    use crate::planner::{GreedyPlanner, MemoryPlanner};
    use crate::recorder::ExecutionRecorder;
    use bumpalo::Bump;

    fn model() -> Model {
        let mut builder = ModelBuilder::new();
        let input = builder.add_tensor(TensorType::Float32, &[1, 4]);
        let weights = builder.add_constant(TensorType::Float32, &[4, 4], vec![0u8; 64]);
        let hidden = builder.add_tensor(TensorType::Float32, &[1, 4]);
        let relu = builder.add_tensor(TensorType::Float32, &[1, 4]);
        let output = builder.add_tensor(TensorType::Float32, &[1, 4]);
        builder.set_quantization(weights, vec![0.5, 0.25], vec![1, 2], 0);
        builder.set_inputs(&[input]);
        builder.set_outputs(&[output]);
        builder.add_operator(
            OperatorSpec::new(BuiltinOperator::FULLY_CONNECTED, 1, &[input, weights, -1], &[hidden])
                .params(vec![1, 0, 0, 0]),
        );
        builder.add_operator(OperatorSpec::new(BuiltinOperator::RELU, 1, &[hidden], &[relu]));
        builder.add_operator(OperatorSpec::new(
            BuiltinOperator::FULLY_CONNECTED,
            1,
            &[relu, weights, -1],
            &[output],
        ));
        Model::from_bytes(builder.build()).unwrap()
    }

    fn generate(model: &Model, timestamp: bool) -> GeneratedProgram {
        let resolver = BuiltinOpResolver::new();
        let mut arena = HostArena::new(8192);
        let ctx = AddressContext::new(arena.region(), Region::of_slice(model.bytes()));
        let mut engine = HostInterpreter::new(model, &resolver, arena.as_mut_slice()).unwrap();
        let bump = Bump::new();
        let session = CompilationSession::new(&bump);
        let trace = ExecutionRecorder::new(&session).record(&mut engine, &ctx).unwrap();
        let units = trace.analyze_lifetimes(BUFFER_ALIGNMENT).unwrap();
        let plan = GreedyPlanner.plan(&units);
        CodeGenerator::new()
            .timestamp(timestamp)
            .generate(model.bytes(), &trace, &units, &plan)
            .unwrap()
    }

    #[test]
    fn test_program_structure() {
        let model = model();
        let program = generate(&model, false);
        let src = &program.source;

        assert!(src.starts_with("// This file is generated. Do not edit.\n\n#include"));
        for symbol in [
            "g_model_data[]",
            "g_model_data_len",
            "kTensorArenaSize",
            "tensor_arena[kTensorArenaSize]",
            "g_regOp[2]",
            "g_node[3]",
            "g_tensors[5]",
            "g_quants[1]",
            "g_persistentBuf[2]",
            "void Setup()",
            "void Eval()",
            "void *GetInputPtr()",
            "const void *GetOutputPtr()",
        ] {
            assert!(src.contains(symbol), "missing {symbol}");
        }
        assert!(!src.contains("g_scratchBuf["));

        // Registrations are shared by both fully connected nodes.
        assert_eq!(program.registrations, 2);
        assert!(src.contains("g_regOp[0] = tflite::ops::micro::Register_FULLY_CONNECTED();"));
        assert!(src.contains("g_regOp[1] = tflite::ops::micro::Register_RELU();"));
        assert!(src.contains("g_regOp[0]->invoke(&g_ctx, &g_node[2]);"));

        // User data is replayed from the persistent buffer table.
        assert!(src.contains("node.user_data = g_persistentBuf[0];"));
        assert!(src.contains("node.user_data = g_persistentBuf[1];"));
        assert!(src.contains("g_persistentBufNext = 2;"));

        // RELU takes no builtin data.
        assert!(src.contains("node.builtin_data = nullptr;"));
        assert!(src.contains("g_tensors[1].allocation_type = kTfLiteMmapRo;"));
        assert!(src.contains("g_tensors[1].data.data = (void*)(g_model_data + "));
        assert!(src.contains("g_quants[0].scale->data[1] = 0.25f;"));
        assert!(src.contains("return g_ctx.tensors[0].data.data;"));
        assert!(src.contains("return g_ctx.tensors[4].data.data;"));
    }

    #[test]
    fn test_arena_covers_plan_and_retained() {
        let model = model();
        let program = generate(&model, false);
        // 3 activations of 16 bytes, at most two live at once, plus two
        // 32-byte op data blocks.
        assert_eq!(program.arena_size, 32 + 64);
        assert!(program.source.contains("constexpr int kTensorArenaSize = 96;"));
        let persistent: Vec<_> = program
            .buffers
            .iter()
            .filter(|b| b.tag.starts_with("persistent"))
            .collect();
        assert_eq!(persistent.len(), 2);
        assert!(persistent
            .iter()
            .all(|b| matches!(b.address, AddressRecord::Arena(h) if h.0 >= 32)));
    }

    #[test]
    fn test_deterministic_without_timestamp() {
        let model = model();
        let first = generate(&model, false);
        let second = generate(&model, false);
        assert_eq!(first.source, second.source);
    }

    #[test]
    fn test_timestamp_is_the_only_difference() {
        let model = model();
        let plain = generate(&model, false);
        let stamped = generate(&model, true);
        let stamped_lines: Vec<&str> = stamped
            .source
            .lines()
            .filter(|line| !line.starts_with("// Generated on: "))
            .collect();
        let plain_lines: Vec<&str> = plain.source.lines().collect();
        assert_eq!(stamped_lines, plain_lines);
        assert_eq!(stamped.source.lines().count(), plain.source.lines().count() + 1);
    }
}
