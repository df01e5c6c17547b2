//! XVM opcodes
//!
//! The 33 instructions of the XScript ISA, numbered in wire order.

use serde::{Deserialize, Serialize};

/// Opcode groups, used by the disassembler and benchmarks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeCategory {
    /// MOV
    Data,
    /// ADD .. DEC
    Arithmetic,
    /// AND .. SHR
    Bitwise,
    /// CONCAT, GETCHAR, SETCHAR
    String,
    /// JMP .. JLE
    Branch,
    /// PUSH, POP
    Stack,
    /// CALL, RET, CALLHOST
    Call,
    /// PAUSE, EXIT
    System,
}

/// XVM opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u16)]
pub enum Opcode {
    // ═══════════════════════════════════════════════════════════════
    // DATA & ARITHMETIC
    // ═══════════════════════════════════════════════════════════════
    /// dst ← src
    Mov = 0,
    Add = 1,
    Sub = 2,
    Mul = 3,
    Div = 4,
    Mod = 5,
    /// dst ← dst ^ src (power)
    Exp = 6,
    Neg = 7,
    Inc = 8,
    Dec = 9,

    // ═══════════════════════════════════════════════════════════════
    // BITWISE (integer only)
    // ═══════════════════════════════════════════════════════════════
    And = 10,
    Or = 11,
    Xor = 12,
    Not = 13,
    Shl = 14,
    Shr = 15,

    // ═══════════════════════════════════════════════════════════════
    // STRINGS
    // ═══════════════════════════════════════════════════════════════
    Concat = 16,
    /// dst ← str[idx]
    GetChar = 17,
    /// str[idx] ← src
    SetChar = 18,

    // ═══════════════════════════════════════════════════════════════
    // BRANCHES
    // ═══════════════════════════════════════════════════════════════
    Jmp = 19,
    Je = 20,
    Jne = 21,
    Jg = 22,
    Jl = 23,
    Jge = 24,
    Jle = 25,

    // ═══════════════════════════════════════════════════════════════
    // STACK, CALLS & SYSTEM
    // ═══════════════════════════════════════════════════════════════
    Push = 26,
    Pop = 27,
    Call = 28,
    Ret = 29,
    CallHost = 30,
    /// Sleep for N milliseconds
    Pause = 31,
    Exit = 32,
}

impl Opcode {
    /// Every opcode in wire order
    pub const ALL: [Opcode; 33] = [
        Self::Mov,
        Self::Add,
        Self::Sub,
        Self::Mul,
        Self::Div,
        Self::Mod,
        Self::Exp,
        Self::Neg,
        Self::Inc,
        Self::Dec,
        Self::And,
        Self::Or,
        Self::Xor,
        Self::Not,
        Self::Shl,
        Self::Shr,
        Self::Concat,
        Self::GetChar,
        Self::SetChar,
        Self::Jmp,
        Self::Je,
        Self::Jne,
        Self::Jg,
        Self::Jl,
        Self::Jge,
        Self::Jle,
        Self::Push,
        Self::Pop,
        Self::Call,
        Self::Ret,
        Self::CallHost,
        Self::Pause,
        Self::Exit,
    ];

    /// Decode a wire opcode
    pub fn from_u16(code: u16) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }

    pub fn category(&self) -> OpcodeCategory {
        match self {
            Self::Mov => OpcodeCategory::Data,
            Self::Add
            | Self::Sub
            | Self::Mul
            | Self::Div
            | Self::Mod
            | Self::Exp
            | Self::Neg
            | Self::Inc
            | Self::Dec => OpcodeCategory::Arithmetic,
            Self::And | Self::Or | Self::Xor | Self::Not | Self::Shl | Self::Shr => {
                OpcodeCategory::Bitwise
            }
            Self::Concat | Self::GetChar | Self::SetChar => OpcodeCategory::String,
            Self::Jmp | Self::Je | Self::Jne | Self::Jg | Self::Jl | Self::Jge | Self::Jle => {
                OpcodeCategory::Branch
            }
            Self::Push | Self::Pop => OpcodeCategory::Stack,
            Self::Call | Self::Ret | Self::CallHost => OpcodeCategory::Call,
            Self::Pause | Self::Exit => OpcodeCategory::System,
        }
    }

    /// Number of operands the assembler emits for this opcode
    pub fn operand_count(&self) -> usize {
        match self {
            Self::Ret => 0,
            Self::Neg
            | Self::Inc
            | Self::Dec
            | Self::Not
            | Self::Jmp
            | Self::Push
            | Self::Pop
            | Self::Call
            | Self::CallHost
            | Self::Pause
            | Self::Exit => 1,
            Self::GetChar
            | Self::SetChar
            | Self::Je
            | Self::Jne
            | Self::Jg
            | Self::Jl
            | Self::Jge
            | Self::Jle => 3,
            _ => 2,
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Self::Mov => "MOV",
            Self::Add => "ADD",
            Self::Sub => "SUB",
            Self::Mul => "MUL",
            Self::Div => "DIV",
            Self::Mod => "MOD",
            Self::Exp => "EXP",
            Self::Neg => "NEG",
            Self::Inc => "INC",
            Self::Dec => "DEC",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Xor => "XOR",
            Self::Not => "NOT",
            Self::Shl => "SHL",
            Self::Shr => "SHR",
            Self::Concat => "CONCAT",
            Self::GetChar => "GETCHAR",
            Self::SetChar => "SETCHAR",
            Self::Jmp => "JMP",
            Self::Je => "JE",
            Self::Jne => "JNE",
            Self::Jg => "JG",
            Self::Jl => "JL",
            Self::Jge => "JGE",
            Self::Jle => "JLE",
            Self::Push => "PUSH",
            Self::Pop => "POP",
            Self::Call => "CALL",
            Self::Ret => "RET",
            Self::CallHost => "CALLHOST",
            Self::Pause => "PAUSE",
            Self::Exit => "EXIT",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}
