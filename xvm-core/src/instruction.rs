//! Decoded instructions

use crate::opcode::Opcode;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Most operands any instruction carries
pub const MAX_OPERANDS: usize = 3;

/// One opcode plus its operand list. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Vec<Value>,
}

impl Instruction {
    pub fn new(opcode: Opcode, operands: impl Into<Vec<Value>>) -> Self {
        Self {
            opcode,
            operands: operands.into(),
        }
    }

    pub fn operand(&self, index: usize) -> Option<&Value> {
        self.operands.get(index)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        for (i, operand) in self.operands.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{}{}", sep, operand)?;
        }
        Ok(())
    }
}
