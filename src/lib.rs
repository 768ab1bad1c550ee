//! offline-interp - offline memory planning for a microcontroller NN interpreter.
//!
//! The tool runs a model's allocation once on the host, records every
//! address the reference engine hands out, computes buffer lifetimes, packs
//! all buffers into one arena and emits a translation unit whose Setup and
//! Eval routines need no allocator or model parser on the target.
//!
//! # Primary Usage
//!
//! ```ignore
//! use offline_interp::{CompileOptions, Compiler};
//! use offline_interp::model::Model;
//!
//! let model = Model::from_bytes(std::fs::read("model.tmdl")?)?;
//! let output = Compiler::new(CompileOptions::default()).compile(&model)?;
//! std::fs::write("model.cc", &output.source)?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Session, address classification, lifetime analysis, errors
//! - [`model`] - Model container decoder and builder
//! - [`engine`] - Reference engine interface and host implementation
//! - [`recorder`] - Captures one reference run
//! - [`planner`] - Greedy and optimal arena planners
//! - [`codegen`] - Generated program
//! - [`report`] - Textual memory map
//! - [`driver`] - Phase orchestration

pub mod codegen;
pub mod config;
pub mod core;
pub mod driver;
pub mod engine;
pub mod model;
pub mod planner;
pub mod recorder;
pub mod report;

pub use codegen::{CodeGenerator, GeneratedProgram, PlacedBuffer};
pub use config::CompileOptions;
pub use self::core::{
    AddressContext, AddressRecord, AllocationUnit, ArenaHandle, CompilationSession, CompileError,
    CompileResult, ConstHandle, LifetimeAnalyzer, SessionStats, UnitId,
};
pub use driver::{probe_arena_size, CompileOutput, Compiler};
pub use planner::{GreedyPlanner, MemoryPlan, MemoryPlanner, OptimalPlanner, PlannerKind};
pub use recorder::{ExecutionRecorder, ExecutionTrace};
pub use report::MemoryMap;
