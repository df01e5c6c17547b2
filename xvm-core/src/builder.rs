//! Programmatic construction of program images
//!
//! Stands in for the external assembler in tests, benches and demos.
//!
//! ```
//! use xvm_core::{Opcode, ProgramBuilder, Value};
//!
//! let mut b = ProgramBuilder::new();
//! b.begin_function("Main", 0, 1);
//! b.emit(Opcode::Mov, &[Value::AbsStack(-2), Value::Int(1)]);
//! b.emit(Opcode::Add, &[Value::AbsStack(-2), Value::Int(2)]);
//! b.emit(Opcode::Exit, &[Value::AbsStack(-2)]);
//! let image = b.main("Main").build();
//! assert_eq!(image.instructions.len(), 3);
//! ```

use crate::image::{Function, Priority, ProgramImage, XseHeader};
use crate::instruction::Instruction;
use crate::opcode::Opcode;
use crate::value::Value;

/// Incremental builder for [`ProgramImage`]
#[derive(Debug, Clone, Default)]
pub struct ProgramBuilder {
    image: ProgramImage,
    main_name: Option<String>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a string literal, returning its table index
    pub fn string(&mut self, text: &str) -> u32 {
        if let Some(index) = self.image.strings.iter().position(|s| s == text) {
            return index as u32;
        }
        self.image.strings.push(text.to_string());
        (self.image.strings.len() - 1) as u32
    }

    /// Add a host API name (case-insensitive dedup), returning its index
    pub fn host_api(&mut self, name: &str) -> u32 {
        if let Some(index) = self
            .image
            .host_apis
            .iter()
            .position(|s| s.eq_ignore_ascii_case(name))
        {
            return index as u32;
        }
        self.image.host_apis.push(name.to_string());
        (self.image.host_apis.len() - 1) as u32
    }

    /// Declare a function whose entry point is the next emitted
    /// instruction, returning its table index
    pub fn begin_function(&mut self, name: &str, param_count: u8, local_data_size: u32) -> u32 {
        self.image.functions.push(Function {
            name: name.to_string(),
            entry: self.here(),
            param_count,
            local_data_size,
        });
        (self.image.functions.len() - 1) as u32
    }

    /// Index the next emitted instruction will have
    pub fn here(&self) -> u32 {
        self.image.instructions.len() as u32
    }

    /// Append an instruction, returning its index
    pub fn emit(&mut self, opcode: Opcode, operands: &[Value]) -> u32 {
        let index = self.here();
        self.image
            .instructions
            .push(Instruction::new(opcode, operands.to_vec()));
        index
    }

    /// Rewrite an operand of an already emitted instruction (jump patching)
    pub fn patch(&mut self, instr: u32, operand: usize, value: Value) -> &mut Self {
        if let Some(slot) = self
            .image
            .instructions
            .get_mut(instr as usize)
            .and_then(|i| i.operands.get_mut(operand))
        {
            *slot = value;
        }
        self
    }

    /// Name the entry-point function; resolved in [`build`](Self::build)
    pub fn main(&mut self, name: &str) -> &mut Self {
        self.main_name = Some(name.to_string());
        self
    }

    pub fn stack_size(&mut self, slots: u32) -> &mut Self {
        self.image.header.stack_size = slots;
        self
    }

    pub fn global_data_size(&mut self, slots: u32) -> &mut Self {
        self.image.header.global_data_size = slots;
        self
    }

    pub fn priority(&mut self, priority: Priority) -> &mut Self {
        self.image.header.priority = priority;
        self
    }

    /// Switch to [`Priority::User`] with an explicit timeslice
    pub fn user_timeslice(&mut self, ms: u32) -> &mut Self {
        self.image.header.priority = Priority::User;
        self.image.header.user_timeslice_ms = ms;
        self
    }

    pub fn build(&self) -> ProgramImage {
        let mut image = self.image.clone();
        image.header = XseHeader {
            main_index: self
                .main_name
                .as_deref()
                .and_then(|name| image.find_function(name))
                .map(|(index, _)| index),
            ..image.header.clone()
        };
        image
    }

    /// Build and serialize
    pub fn to_bytes(&self) -> Vec<u8> {
        self.build().to_bytes()
    }
}
