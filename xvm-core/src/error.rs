//! Error types for the XVM

use thiserror::Error;

use crate::SlotIndex;

/// Result type for engine operations
pub type VmResult<T> = Result<T, VmError>;

/// Typed failures of the program loader.
///
/// Load errors are recoverable by the caller (retry with another file,
/// unload a slot and try again).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Source could not be read
    #[error("File I/O error: {0}")]
    FileIo(String),

    /// Bad magic, truncated stream, unknown opcode or operand tag
    #[error("Invalid .XSE file: {0}")]
    InvalidFormat(String),

    /// Version pair does not match exactly
    #[error("Unsupported .XSE version {major}.{minor} (expected {expected_major}.{expected_minor})")]
    UnsupportedVersion {
        major: u8,
        minor: u8,
        expected_major: u8,
        expected_minor: u8,
    },

    /// Requested allocation is too large
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Every script slot is in use
    #[error("Out of threads: all script slots are in use")]
    OutOfThreads,
}

impl From<std::io::Error> for LoadError {
    fn from(err: std::io::Error) -> Self {
        LoadError::FileIo(err.to_string())
    }
}

/// Runtime faults raised while executing an instruction.
///
/// The binary format is produced by a trusted assembler, so these only fire
/// on toolchain bugs or hand-crafted images.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error("instruction index {index} out of range ({count} instructions)")]
    InstructionOutOfRange { index: u64, count: usize },

    #[error("operand {index} missing ({count} operands)")]
    MissingOperand { index: usize, count: usize },

    #[error("operand {index} is not a writable location")]
    NotWritable { index: usize },

    #[error("stack index {index} out of range (size {size})")]
    StackOutOfRange { index: i64, size: usize },

    #[error("stack overflow (size {size})")]
    StackOverflow { size: usize },

    #[error("stack underflow")]
    StackUnderflow,

    #[error("invalid function index {index}")]
    InvalidFunction { index: u32 },

    #[error("invalid string index {index}")]
    InvalidString { index: u32 },

    #[error("invalid host API index {index}")]
    InvalidHostApi { index: u32 },

    #[error("character index {index} out of range (length {len})")]
    CharOutOfRange { index: i32, len: usize },

    #[error("corrupt call frame bookkeeping")]
    CorruptFrame,

    #[error("integer division by zero")]
    DivisionByZero,

    #[error("operand {index} is {found}, expected {expected}")]
    TypeMismatch {
        index: usize,
        expected: &'static str,
        found: &'static str,
    },
}

/// Errors of the engine-facing API
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VmError {
    /// Program could not be loaded
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    /// A script faulted; the offending slot and instruction are identified
    #[error("Script {slot} faulted at instruction {instr}: {fault}")]
    Fault {
        slot: SlotIndex,
        instr: usize,
        fault: Fault,
    },

    /// Slot index beyond the slot table
    #[error("Invalid script slot: {0}")]
    InvalidSlot(SlotIndex),

    /// Slot exists but holds no script
    #[error("Script slot {0} is not active")]
    InactiveSlot(SlotIndex),

    /// No function with this name in the script
    #[error("Function '{name}' not found in script {slot}")]
    FunctionNotFound { slot: SlotIndex, name: String },

    /// Host API table has no free entry
    #[error("Host API table full ({capacity} entries)")]
    HostApiTableFull { capacity: usize },

    /// Error raised by a native host callback
    #[error("Host API '{name}' failed: {message}")]
    Host { name: String, message: String },
}

impl VmError {
    /// Convenience constructor used by host callbacks
    pub fn host(name: impl Into<String>, message: impl Into<String>) -> Self {
        VmError::Host {
            name: name.into(),
            message: message.into(),
        }
    }
}
