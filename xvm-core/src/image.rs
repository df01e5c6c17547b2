//! Binary program image (.XSE)
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ "XSE0" │ major u8 │ minor u8                                  │
//! │ stack_size u32 │ global_data u32 │ main? u8 │ main_idx u32    │
//! │ priority u8 │ user_timeslice u32                             │
//! ├──────────────────────────────────────────────────────────────┤
//! │ count u32 │ { opcode u16 │ opcount u8 │ { tag u8 │ payload } }│
//! ├──────────────────────────────────────────────────────────────┤
//! │ count u32 │ { len u32 │ bytes }                  strings      │
//! │ count u32 │ { entry u32 │ params u8 │ locals u32 │ name u8+ } │
//! │ count u32 │ { len u8 │ bytes }                   host APIs    │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use crate::error::LoadError;
use crate::instruction::{Instruction, MAX_OPERANDS};
use crate::opcode::Opcode;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Magic identifier
pub const XSE_MAGIC: &[u8; 4] = b"XSE0";

/// Format version accepted by the loader
pub const XSE_VERSION_MAJOR: u8 = 0;
pub const XSE_VERSION_MINOR: u8 = 8;

/// Scheduling priority stored in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Priority {
    /// Use the timeslice stored in the header
    User = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl Priority {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::User),
            1 => Some(Self::Low),
            2 => Some(Self::Medium),
            3 => Some(Self::High),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "low" => Ok(Self::Low),
            "medium" | "med" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Header fields following magic and version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XseHeader {
    /// Requested stack slots, 0 for the configured default
    pub stack_size: u32,
    pub global_data_size: u32,
    /// Function table index of the entry point
    pub main_index: Option<u32>,
    pub priority: Priority,
    /// Timeslice used with [`Priority::User`]
    pub user_timeslice_ms: u32,
}

impl Default for XseHeader {
    fn default() -> Self {
        Self {
            stack_size: 0,
            global_data_size: 0,
            main_index: None,
            priority: Priority::Low,
            user_timeslice_ms: 0,
        }
    }
}

/// Function table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    /// Names compare case-insensitively
    pub name: String,
    pub entry: u32,
    pub param_count: u8,
    pub local_data_size: u32,
}

impl Function {
    /// Slots a call occupies: params, return address and locals
    /// (the bookkeeping slot is counted inside `local_data_size + 1`)
    pub fn stack_frame_size(&self) -> usize {
        usize::from(self.param_count) + 1 + self.local_data_size as usize
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Deserialized program
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProgramImage {
    pub header: XseHeader,
    pub instructions: Vec<Instruction>,
    pub strings: Vec<String>,
    pub functions: Vec<Function>,
    pub host_apis: Vec<String>,
}

impl ProgramImage {
    /// Read and parse a program file
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Write the binary form to a file
    pub fn save(&self, path: &Path) -> Result<(), LoadError> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }

    pub fn main_function(&self) -> Option<&Function> {
        self.header
            .main_index
            .and_then(|index| self.functions.get(index as usize))
    }

    /// Case-insensitive lookup, returning the table index
    pub fn find_function(&self, name: &str) -> Option<(u32, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .find(|(_, f)| f.is_named(name))
            .map(|(i, f)| (i as u32, f))
    }

    /// Parse the binary layout
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LoadError> {
        let mut reader = Reader::new(bytes);

        let magic = reader.take(4, "magic")?;
        if magic != XSE_MAGIC {
            return Err(LoadError::InvalidFormat(format!(
                "invalid magic: expected {:?}, got {:?}",
                String::from_utf8_lossy(XSE_MAGIC),
                String::from_utf8_lossy(magic)
            )));
        }

        let major = reader.u8("major version")?;
        let minor = reader.u8("minor version")?;
        if (major, minor) != (XSE_VERSION_MAJOR, XSE_VERSION_MINOR) {
            return Err(LoadError::UnsupportedVersion {
                major,
                minor,
                expected_major: XSE_VERSION_MAJOR,
                expected_minor: XSE_VERSION_MINOR,
            });
        }

        let stack_size = reader.u32("stack size")?;
        let global_data_size = reader.u32("global data size")?;
        let main_present = reader.u8("main flag")? != 0;
        let main_index = reader.u32("main index")?;
        let priority_byte = reader.u8("priority")?;
        let priority = Priority::from_byte(priority_byte).ok_or_else(|| {
            LoadError::InvalidFormat(format!("unknown priority type {}", priority_byte))
        })?;
        let user_timeslice_ms = reader.u32("timeslice")?;

        let header = XseHeader {
            stack_size,
            global_data_size,
            main_index: main_present.then_some(main_index),
            priority,
            user_timeslice_ms,
        };

        // Instruction stream: every entry is at least opcode + opcount
        let count = reader.count(3, "instruction stream")?;
        let mut instructions = reserve(count, "instruction stream")?;
        for index in 0..count {
            instructions.push(read_instruction(&mut reader, index)?);
        }

        let count = reader.count(4, "string table")?;
        let mut strings = reserve(count, "string table")?;
        for _ in 0..count {
            let len = reader.u32("string length")? as usize;
            strings.push(reader.text(len, "string")?);
        }

        let count = reader.count(10, "function table")?;
        let mut functions = reserve(count, "function table")?;
        for _ in 0..count {
            let entry = reader.u32("function entry")?;
            let param_count = reader.u8("parameter count")?;
            let local_data_size = reader.u32("local data size")?;
            let name_len = usize::from(reader.u8("function name length")?);
            let name = reader.text(name_len, "function name")?;
            functions.push(Function {
                name,
                entry,
                param_count,
                local_data_size,
            });
        }

        let count = reader.count(1, "host API table")?;
        let mut host_apis = reserve(count, "host API table")?;
        for _ in 0..count {
            let len = usize::from(reader.u8("host API name length")?);
            host_apis.push(reader.text(len, "host API name")?);
        }

        Ok(Self {
            header,
            instructions,
            strings,
            functions,
            host_apis,
        })
    }

    /// Serialize to the binary layout read by [`from_bytes`](Self::from_bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();

        bytes.extend_from_slice(XSE_MAGIC);
        bytes.push(XSE_VERSION_MAJOR);
        bytes.push(XSE_VERSION_MINOR);
        bytes.extend_from_slice(&self.header.stack_size.to_le_bytes());
        bytes.extend_from_slice(&self.header.global_data_size.to_le_bytes());
        bytes.push(u8::from(self.header.main_index.is_some()));
        bytes.extend_from_slice(&self.header.main_index.unwrap_or(0).to_le_bytes());
        bytes.push(self.header.priority as u8);
        bytes.extend_from_slice(&self.header.user_timeslice_ms.to_le_bytes());

        bytes.extend_from_slice(&(self.instructions.len() as u32).to_le_bytes());
        for instr in &self.instructions {
            bytes.extend_from_slice(&(instr.opcode as u16).to_le_bytes());
            // Runtime-only values have no wire tag and are dropped
            let operands: Vec<(u8, &Value)> = instr
                .operands
                .iter()
                .filter_map(|v| v.wire_tag().map(|tag| (tag, v)))
                .collect();
            bytes.push(operands.len() as u8);
            for (tag, value) in operands {
                bytes.push(tag);
                write_payload(&mut bytes, value);
            }
        }

        bytes.extend_from_slice(&(self.strings.len() as u32).to_le_bytes());
        for s in &self.strings {
            bytes.extend_from_slice(&(s.len() as u32).to_le_bytes());
            bytes.extend_from_slice(s.as_bytes());
        }

        bytes.extend_from_slice(&(self.functions.len() as u32).to_le_bytes());
        for func in &self.functions {
            let name = truncated(&func.name);
            bytes.extend_from_slice(&func.entry.to_le_bytes());
            bytes.push(func.param_count);
            bytes.extend_from_slice(&func.local_data_size.to_le_bytes());
            bytes.push(name.len() as u8);
            bytes.extend_from_slice(name);
        }

        bytes.extend_from_slice(&(self.host_apis.len() as u32).to_le_bytes());
        for name in &self.host_apis {
            let name = truncated(name);
            bytes.push(name.len() as u8);
            bytes.extend_from_slice(name);
        }

        bytes
    }

    /// Assembly listing with instruction indices and function labels
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for (index, instr) in self.instructions.iter().enumerate() {
            for func in self.functions.iter().filter(|f| f.entry as usize == index) {
                out.push_str(&format!("{}:\n", func.name));
            }
            out.push_str(&format!("{:>6}  {}\n", index, instr));
        }
        out
    }
}

/// Names are length-prefixed with a single byte; cut on a char boundary
fn truncated(name: &str) -> &[u8] {
    let mut end = name.len().min(u8::MAX as usize);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name.as_bytes()[..end]
}

fn write_payload(bytes: &mut Vec<u8>, value: &Value) {
    match *value {
        Value::Int(v) | Value::AbsStack(v) => bytes.extend_from_slice(&v.to_le_bytes()),
        Value::Float(v) => bytes.extend_from_slice(&v.to_le_bytes()),
        Value::Str(v) | Value::Instr(v) | Value::Func(v) | Value::HostApi(v) | Value::Reg(v) => {
            bytes.extend_from_slice(&v.to_le_bytes())
        }
        Value::RelStack { base, offset } => {
            bytes.extend_from_slice(&base.to_le_bytes());
            bytes.extend_from_slice(&offset.to_le_bytes());
        }
        Value::Null | Value::Frame(_) | Value::StackBase(_) => {}
    }
}

fn read_instruction(reader: &mut Reader<'_>, index: usize) -> Result<Instruction, LoadError> {
    let code = reader.u16("opcode")?;
    let opcode = Opcode::from_u16(code).ok_or_else(|| {
        LoadError::InvalidFormat(format!("unknown opcode {} at instruction {}", code, index))
    })?;

    let opcount = usize::from(reader.u8("operand count")?);
    if opcount > MAX_OPERANDS {
        return Err(LoadError::InvalidFormat(format!(
            "instruction {} has {} operands (max {})",
            index, opcount, MAX_OPERANDS
        )));
    }

    let mut operands = Vec::with_capacity(opcount);
    for _ in 0..opcount {
        let tag = reader.u8("operand tag")?;
        let value = match tag {
            0 => Value::Int(reader.i32("int literal")?),
            1 => Value::Float(reader.f32("float literal")?),
            2 => Value::Str(reader.u32("string index")?),
            3 => Value::AbsStack(reader.i32("stack index")?),
            4 => Value::RelStack {
                base: reader.i32("stack index")?,
                offset: reader.i32("offset index")?,
            },
            5 => Value::Instr(reader.u32("instruction index")?),
            6 => Value::Func(reader.u32("function index")?),
            7 => Value::HostApi(reader.u32("host API index")?),
            8 => Value::Reg(reader.u32("register")?),
            other => {
                return Err(LoadError::InvalidFormat(format!(
                    "unknown operand tag {} at instruction {}",
                    other, index
                )));
            }
        };
        operands.push(value);
    }

    Ok(Instruction { opcode, operands })
}

fn reserve<T>(count: usize, what: &str) -> Result<Vec<T>, LoadError> {
    let mut table = Vec::new();
    table
        .try_reserve_exact(count)
        .map_err(|_| LoadError::OutOfMemory(format!("{} with {} entries", what, count)))?;
    Ok(table)
}

/// Bounds-checked little-endian cursor
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8], LoadError> {
        if len > self.remaining() {
            return Err(LoadError::InvalidFormat(format!(
                "truncated {} at offset {} (need {} bytes, {} left)",
                what,
                self.pos,
                len,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// `len` bytes of UTF-8; anything else is rejected rather than repaired
    fn text(&mut self, len: usize, what: &str) -> Result<String, LoadError> {
        let offset = self.pos;
        let bytes = self.take(len, what)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| LoadError::InvalidFormat(format!("{} at offset {} is not UTF-8: {}", what, offset, e)))
    }

    fn array<const N: usize>(&mut self, what: &str) -> Result<[u8; N], LoadError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    fn u8(&mut self, what: &str) -> Result<u8, LoadError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> Result<u16, LoadError> {
        self.array(what).map(u16::from_le_bytes)
    }

    fn u32(&mut self, what: &str) -> Result<u32, LoadError> {
        self.array(what).map(u32::from_le_bytes)
    }

    fn i32(&mut self, what: &str) -> Result<i32, LoadError> {
        self.array(what).map(i32::from_le_bytes)
    }

    fn f32(&mut self, what: &str) -> Result<f32, LoadError> {
        self.array(what).map(f32::from_le_bytes)
    }

    /// Table length, rejected when the remaining bytes cannot hold
    /// `count` entries of at least `min_entry` bytes
    fn count(&mut self, min_entry: usize, what: &str) -> Result<usize, LoadError> {
        let count = self.u32(what)? as usize;
        if count.saturating_mul(min_entry) > self.remaining() {
            return Err(LoadError::InvalidFormat(format!(
                "truncated {}: {} entries declared, {} bytes left",
                what,
                count,
                self.remaining()
            )));
        }
        Ok(count)
    }
}
