// This module defines the error types for offline-interp using the thiserror crate. CompileError
// is the crate-level enum; it wraps the model container errors (ModelError) and the reference
// engine errors (EngineError) and adds the pipeline's own failure modes: file I/O, addresses
// outside every tracked region, allocation units with a partial lifetime, memory plans that place
// two live buffers on top of each other, and arena addresses the generated layout cannot
// relocate. Everything except I/O, configuration and the wrapped errors is an internal defect
// rather than a user error and is reported separately by the command line front end. Lifetime
// defects the engine hits while planning its own arena head are unwrapped into the matching
// variant here. CompileResult<T> is the
// matching Result alias.

//! Error types for the compilation pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::lifetime::UnitId;
use crate::engine::EngineError;
use crate::model::ModelError;

/// Main error type for one compilation run.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("model format error: {0}")]
    ModelFormat(#[from] ModelError),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("reference engine failed: {0}")]
    Engine(EngineError),

    #[error("address {addr:#x} is outside the arena and the constant model data")]
    OutOfRegion { addr: usize },

    #[error(
        "{unit} has an invalid lifetime: first_created: {first_created:?}, last_used: {last_used:?}"
    )]
    InconsistentLifetime {
        unit: UnitId,
        first_created: Option<usize>,
        last_used: Option<usize>,
    },

    #[error("memory plan places {first} and {second} in overlapping ranges while both are live")]
    PlanViolation { first: UnitId, second: UnitId },

    #[error("memory plan leaves {unit} without an offset")]
    UnplacedUnit { unit: UnitId },

    #[error("tensor index {index} is out of range ({count} tensors)")]
    TensorIndex { index: i32, count: usize },

    #[error("arena offset {offset} is neither planned nor in the retained region")]
    UnrelocatableAddress { offset: usize },

    #[error("failed to format generated code")]
    Format(#[from] std::fmt::Error),
}

impl CompileError {
    /// Whether this error is a broken pipeline invariant rather than bad input.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            CompileError::OutOfRegion { .. }
                | CompileError::InconsistentLifetime { .. }
                | CompileError::PlanViolation { .. }
                | CompileError::UnplacedUnit { .. }
                | CompileError::TensorIndex { .. }
                | CompileError::UnrelocatableAddress { .. }
                | CompileError::Format(_)
                | CompileError::Engine(EngineError::Planning(_))
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CompileError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<EngineError> for CompileError {
    /// Planning defects raised inside the engine keep their own variant.
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InconsistentLifetime {
                unit,
                first_created,
                last_used,
            } => CompileError::InconsistentLifetime {
                unit,
                first_created,
                last_used,
            },
            EngineError::TensorIndex { index, count } => CompileError::TensorIndex { index, count },
            other => CompileError::Engine(other),
        }
    }
}

/// Result type alias for pipeline operations.
pub type CompileResult<T> = Result<T, CompileError>;
