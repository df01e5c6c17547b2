//! Runtime values
//!
//! Every stack slot, operand and the return register holds a [`Value`].
//! The variant is the type tag; payloads are only reachable through
//! pattern matching.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Call bookkeeping written by CALL into the last slot of a new frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRecord {
    /// Index of the callee in the function table
    pub function: u32,
    /// Frame pointer of the caller, restored by RET
    pub caller_frame: usize,
}

/// Tagged runtime value
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    /// Uninitialized slot
    #[default]
    Null,
    /// Integer literal
    Int(i32),
    /// Floating-point literal
    Float(f32),
    /// Index into the owning script's string table.
    ///
    /// Table entries are UTF-8 (the loader rejects anything else) and
    /// GETCHAR/SETCHAR index them by `char`, not by byte. The two agree
    /// for ASCII text.
    Str(u32),
    /// Stack index; negative indices are relative to the frame pointer
    AbsStack(i32),
    /// Array element: `base` plus the integer stored at stack slot `offset`
    RelStack { base: i32, offset: i32 },
    /// Instruction index (jump targets, return addresses)
    Instr(u32),
    /// Function table index
    Func(u32),
    /// Host API name table index
    HostApi(u32),
    /// Register operand; the id is ignored, there is one register
    Reg(u32),
    /// Call bookkeeping
    Frame(FrameRecord),
    /// Call bookkeeping of the outermost synchronous host call
    StackBase(FrameRecord),
}

impl Value {
    /// Wire tag used by the binary format, `None` for runtime-only variants
    pub fn wire_tag(&self) -> Option<u8> {
        match self {
            Value::Int(_) => Some(0),
            Value::Float(_) => Some(1),
            Value::Str(_) => Some(2),
            Value::AbsStack(_) => Some(3),
            Value::RelStack { .. } => Some(4),
            Value::Instr(_) => Some(5),
            Value::Func(_) => Some(6),
            Value::HostApi(_) => Some(7),
            Value::Reg(_) => Some(8),
            Value::Null | Value::Frame(_) | Value::StackBase(_) => None,
        }
    }

    /// Short type name, used in diagnostics and disassembly
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::AbsStack(_) => "stack",
            Value::RelStack { .. } => "stack[rel]",
            Value::Instr(_) => "instr",
            Value::Func(_) => "func",
            Value::HostApi(_) => "host",
            Value::Reg(_) => "reg",
            Value::Frame(_) => "frame",
            Value::StackBase(_) => "stack-base",
        }
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Value::Int(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::Str(_))
    }

    /// Operand that names a storage location rather than a literal
    pub fn is_location(&self) -> bool {
        matches!(self, Value::AbsStack(_) | Value::RelStack { .. } | Value::Reg(_))
    }

    /// Bookkeeping record, if this slot holds one
    pub fn frame_record(&self) -> Option<(FrameRecord, bool)> {
        match *self {
            Value::Frame(record) => Some((record, false)),
            Value::StackBase(record) => Some((record, true)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    /// Assembly-like rendering
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{:?}", v),
            Value::Str(i) => write!(f, "str#{}", i),
            Value::AbsStack(i) => write!(f, "[{}]", i),
            Value::RelStack { base, offset } => write!(f, "[{} + [{}]]", base, offset),
            Value::Instr(i) => write!(f, "@{}", i),
            Value::Func(i) => write!(f, "func#{}", i),
            Value::HostApi(i) => write!(f, "host#{}", i),
            Value::Reg(_) => write!(f, "_RetVal"),
            Value::Frame(r) => write!(f, "<frame func#{} caller={}>", r.function, r.caller_frame),
            Value::StackBase(r) => {
                write!(f, "<stack-base func#{} caller={}>", r.function, r.caller_frame)
            }
        }
    }
}

/// Leading-integer parse with C `atoi` semantics: optional whitespace and
/// sign, then digits; anything else yields 0.
pub(crate) fn parse_leading_int(text: &str) -> i32 {
    let text = text.trim_start();
    let (negative, digits) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };

    let mut value: i64 = 0;
    for byte in digits.bytes().take_while(u8::is_ascii_digit) {
        value = value * 10 + i64::from(byte - b'0');
        if value > i64::from(i32::MAX) + 1 {
            break;
        }
    }
    let value = if negative { -value } else { value };
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Leading-float parse with C `atof` semantics: the longest numeric prefix
/// wins, 0.0 when there is none.
pub(crate) fn parse_leading_float(text: &str) -> f32 {
    let text = text.trim_start();
    let end = text
        .char_indices()
        .take_while(|&(i, c)| {
            c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || ((c == '-' || c == '+') && i == 0)
                || ((c == '-' || c == '+') && matches!(text.as_bytes().get(i.wrapping_sub(1)), Some(b'e' | b'E')))
        })
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(0);

    (1..=end)
        .rev()
        .filter(|&len| text.is_char_boundary(len))
        .find_map(|len| text[..len].parse::<f32>().ok())
        .unwrap_or(0.0)
}
