//! Module containing the universal error type
use thiserror::Error;

/// Universal error type for `carve`
#[derive(Error, Debug)]
pub enum Error {
    /// Could not get a WGPU adapter
    #[error("could not get adapter")]
    NoAdapter,

    /// Could not get a WGPU device
    #[error("could not get WGPU device")]
    NoDevice(#[from] wgpu::RequestDeviceError),

    /// The device was lost; the session cannot continue
    #[error("device lost: {0}")]
    DeviceLost(String),

    /// Per-axis subdivision must be at least 2
    #[error("per-axis subdivision must be at least 2 (got {0})")]
    BadSplit(u32),

    /// The region array ring needs an entry and a terminal generation
    #[error("generation count must be at least 2 (got {0})")]
    BadGenerationCount(usize),

    /// `fanout^generation` does not fit in a `u64`
    #[error("capacity of generation {generation} overflows (fan-out {fanout})")]
    CapacityOverflow {
        /// Generation index
        generation: usize,
        /// Fan-out per generation
        fanout: u64,
    },

    /// A region array is larger than the device allows
    #[error(
        "generation {generation} needs {size} bytes, \
         but the device limit is {limit}"
    )]
    BufferTooLarge {
        /// Generation index
        generation: usize,
        /// Requested buffer size, in bytes
        size: u64,
        /// Device limit, in bytes
        limit: u64,
    },

    /// A generation holds more regions than one indirect dispatch can launch
    #[error(
        "generation {generation} holds {capacity} regions, \
         but the device dispatches at most {limit} workgroups per dimension"
    )]
    DispatchLimit {
        /// Generation index
        generation: usize,
        /// Region capacity of that generation
        capacity: u64,
        /// Device limit on workgroups per dimension
        limit: u32,
    },

    /// Tape buffer is too large for the device
    #[error("tape of {0} instructions does not fit in a storage binding")]
    TapeBufferTooLarge(u32),

    /// Tape is longer than the tape buffer
    #[error("tape has {len} instructions, but the limit is {max}")]
    TapeTooLong {
        /// Number of instructions in the tape
        len: usize,
        /// Configured instruction limit
        max: u32,
    },

    /// Tape bytes are shorter than the 4-byte header
    #[error("tape is missing its header")]
    MissingTapeHeader,

    /// Tape header disagrees with the number of trailing bytes
    #[error(
        "tape header claims {expected} instructions, \
         but {actual} bytes follow"
    )]
    BadTapeLength {
        /// Instruction count from the header
        expected: u32,
        /// Number of bytes after the header
        actual: usize,
    },

    /// Unknown opcode in a tape
    #[error("unknown opcode {opcode} at instruction {index}")]
    UnknownOpcode {
        /// Raw opcode byte
        opcode: u8,
        /// Index of the offending instruction
        index: usize,
    },

    /// Register index exceeds the evaluator's register file
    #[error("register {reg} at instruction {index} exceeds the register file")]
    BadRegister {
        /// Register index
        reg: u8,
        /// Index of the offending instruction
        index: usize,
    },

    /// The transform matrix cannot be inverted
    #[error("transform matrix is singular")]
    SingularTransform,

    /// Transform dimensionality does not match the surface
    #[error("expected a {expected}D transform")]
    WrongTransform {
        /// Dimensionality of the configured surface
        expected: usize,
    },

    /// Output image size is zero or above the device limits
    #[error("unsupported image size {0}×{1}")]
    BadImageSize(u32, u32),

    /// Waiting on the device during a readback failed
    #[error("readback failed")]
    Readback(#[from] wgpu::PollError),
}
