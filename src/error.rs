//! Error types for the ray tracing emulation layer.
//!
//! Failures fall into three kinds, surfaced at the call that violates the
//! respective contract:
//!
//! - [`ConfigurationError`]: the caller handed us descriptors that can never
//!   work (empty stage lists, dangling stage references, geometry buffers
//!   without staged build input). Detected before any external toolchain
//!   call is made where possible.
//! - [`StateError`]: an operation was issued in the wrong order (querying an
//!   unbuilt container, dispatching without a pipeline, mismatched
//!   pipeline/container pairing).
//! - [`ValidationError`]: per-call argument validation (trace dimensions not
//!   divisible by the workgroup shape).
//!
//! Nothing is retried or recovered internally; every error aborts the current
//! operation and leaves previously built state intact.

use thiserror::Error;

use crate::device::Buffer;
use crate::shader::StageKind;

/// Descriptor-level misconfiguration. These are caller bugs and are reported
/// before external toolchain calls wherever detectable.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("no shader stages defined for ray tracing pipeline")]
    EmptyStageList,

    #[error("shader group range {first}..{end} is out of bounds for {count} groups")]
    GroupRangeOutOfBounds {
        first: usize,
        end: usize,
        count: usize,
    },

    #[error("shader group references stage {index}, but the pipeline has {count} stages")]
    StageIndexOutOfRange { index: usize, count: usize },

    #[error("shader group references stage {index} as {expected:?}, but it is {actual:?}")]
    StageKindMismatch {
        index: usize,
        expected: StageKind,
        actual: StageKind,
    },

    #[error(
        "general shader group references stage {index}, which is {actual:?} rather than a \
         generation or miss stage"
    )]
    GeneralGroupStageInvalid { index: usize, actual: StageKind },

    #[error(
        "geometry buffer {buffer:?} has no staged contents; it must be created through the \
         extension device with ACCELERATION_STRUCTURE_BUILD_INPUT usage"
    )]
    MissingBufferData { buffer: Buffer },

    #[error("bind group contains more than one acceleration container")]
    MultipleAccelerationContainers,
}

/// An operation was issued while the emulation layer was in the wrong state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("acceleration container has not been built")]
    ContainerNotBuilt,

    #[error("an acceleration container is already bound to this pass")]
    ContainerAlreadyBound,

    #[error("no ray tracing pipeline is set")]
    MissingPipeline,

    #[error("no acceleration container is bound")]
    MissingContainer,

    #[error("bound acceleration container is not the one the pipeline was compiled against")]
    ContainerMismatch,
}

/// Per-call argument validation failures.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("trace dimensions ({width}, {height}, {depth}) must be divisible by the workgroup size")]
    DimensionsNotDivisible { width: u32, height: u32, depth: u32 },
}

/// Umbrella error for every fallible operation in the crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A failure reported by one of the external toolchain collaborators
    /// (transpiler, backend compiler, or tree builder).
    #[error("toolchain: {0}")]
    Toolchain(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
