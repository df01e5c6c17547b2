//! Per-script runtime context
//!
//! A [`Script`] owns its program image, its interned string table, its
//! runtime stack and its scheduling state. Instruction semantics live in
//! [`engine`](crate::engine); this module covers construction, reset,
//! value coercion and the call protocol shared by CALL and the external
//! invocation API.

use crate::config::VmConfig;
use crate::error::{Fault, LoadError};
use crate::image::{Function, Priority, ProgramImage};
use crate::instruction::Instruction;
use crate::stack::RuntimeStack;
use crate::value::{FrameRecord, Value, parse_leading_float, parse_leading_int};
use std::collections::HashMap;

/// Append-only string table, deduplicated by content
#[derive(Debug, Clone, Default)]
pub struct StringTable {
    strings: Vec<String>,
    lookup: HashMap<String, u32>,
}

impl StringTable {
    /// Adopt the table of a loaded image; indices are preserved
    pub fn from_strings(strings: Vec<String>) -> Self {
        let mut lookup = HashMap::with_capacity(strings.len());
        for (index, s) in strings.iter().enumerate() {
            lookup.entry(s.clone()).or_insert(index as u32);
        }
        Self { strings, lookup }
    }

    pub fn get(&self, index: u32) -> Option<&str> {
        self.strings.get(index as usize).map(String::as_str)
    }

    /// Index of `text`, appending it if it is new
    pub fn intern(&mut self, text: &str) -> u32 {
        if let Some(&index) = self.lookup.get(text) {
            return index;
        }
        let index = self.strings.len() as u32;
        self.strings.push(text.to_string());
        self.lookup.insert(text.to_string(), index);
        index
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.strings.iter().map(String::as_str)
    }
}

/// Where a script stood before a blocking call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Checkpoint {
    top: usize,
    frame: usize,
    pc: usize,
}

/// Runtime context of one loaded program
#[derive(Debug, Clone)]
pub struct Script {
    pub(crate) image: ProgramImage,
    pub(crate) strings: StringTable,
    pub(crate) stack: RuntimeStack,
    pub(crate) pc: usize,
    /// `_RetVal` register
    pub(crate) ret_val: Value,
    pub(crate) priority: Priority,
    pub(crate) timeslice_ms: u64,
    pub(crate) running: bool,
    pub(crate) paused: bool,
    pub(crate) pause_end: u64,
    pub(crate) exit_code: Option<i32>,
    pub(crate) executed: u64,
}

impl Script {
    /// Build a context from a parsed image and reset it.
    ///
    /// `priority` overrides the priority stored in the header. `User` is
    /// not an override: it keeps the header's priority and timeslice.
    pub fn from_image(
        mut image: ProgramImage,
        priority: Option<Priority>,
        config: &VmConfig,
    ) -> Result<Self, LoadError> {
        let requested = match image.header.stack_size {
            0 => config.default_stack_size,
            n => n as usize,
        };
        if requested > config.max_stack_size {
            return Err(LoadError::OutOfMemory(format!(
                "stack of {} slots exceeds the limit of {}",
                requested, config.max_stack_size
            )));
        }
        let stack = RuntimeStack::try_new(requested).ok_or_else(|| {
            LoadError::OutOfMemory(format!("cannot allocate a stack of {} slots", requested))
        })?;

        if let Some(main) = image.header.main_index
            && main as usize >= image.functions.len()
        {
            return Err(LoadError::InvalidFormat(format!(
                "main function index {} out of range ({} functions)",
                main,
                image.functions.len()
            )));
        }

        let priority = match priority {
            Some(Priority::User) | None => image.header.priority,
            Some(requested) => requested,
        };
        let timeslice_ms = match priority {
            Priority::User => image.header.user_timeslice_ms,
            Priority::Low => config.timeslice_low_ms,
            Priority::Medium => config.timeslice_medium_ms,
            Priority::High => config.timeslice_high_ms,
        };

        let strings = StringTable::from_strings(std::mem::take(&mut image.strings));
        let mut script = Self {
            image,
            strings,
            stack,
            pc: 0,
            ret_val: Value::Null,
            priority,
            timeslice_ms: u64::from(timeslice_ms),
            running: false,
            paused: false,
            pause_end: 0,
            exit_code: None,
            executed: 0,
        };

        script.reset().map_err(|fault| {
            LoadError::InvalidFormat(format!(
                "stack of {} slots cannot hold the global and main frames: {}",
                requested, fault
            ))
        })?;
        Ok(script)
    }

    /// Return to the freshly loaded state: empty stack, globals and main's
    /// frame reserved, pc at main's entry point
    pub fn reset(&mut self) -> Result<(), Fault> {
        self.pc = self
            .image
            .main_function()
            .map(|main| main.entry as usize)
            .unwrap_or(0);
        self.stack.clear();
        self.paused = false;
        self.pause_end = 0;
        self.running = false;
        self.exit_code = None;
        self.ret_val = Value::Null;

        let main_frame = self
            .image
            .main_function()
            .map(|main| main.local_data_size as usize + 1)
            .unwrap_or(1);
        self.stack
            .push_frame(self.image.header.global_data_size as usize)?;
        self.stack.push_frame(main_frame)
    }

    // ═══════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════

    pub fn image(&self) -> &ProgramImage {
        &self.image
    }

    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    pub fn stack(&self) -> &RuntimeStack {
        &self.stack
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn return_value(&self) -> Value {
        self.ret_val
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn timeslice_ms(&self) -> u64 {
        self.timeslice_ms
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Instructions executed since load
    pub fn executed(&self) -> u64 {
        self.executed
    }

    pub(crate) fn instruction(&self, index: usize) -> Result<&Instruction, Fault> {
        self.image
            .instructions
            .get(index)
            .ok_or(Fault::InstructionOutOfRange {
                index: index as u64,
                count: self.image.instructions.len(),
            })
    }

    pub(crate) fn function(&self, index: u32) -> Result<&Function, Fault> {
        self.image
            .functions
            .get(index as usize)
            .ok_or(Fault::InvalidFunction { index })
    }

    pub(crate) fn string(&self, index: u32) -> Result<&str, Fault> {
        self.strings.get(index).ok_or(Fault::InvalidString { index })
    }

    // ═══════════════════════════════════════════════════════════════
    // Coercions
    // ═══════════════════════════════════════════════════════════════

    pub fn coerce_int(&self, value: &Value) -> Result<i32, Fault> {
        Ok(match *value {
            Value::Int(v) => v,
            Value::Float(v) => v as i32,
            Value::Str(i) => parse_leading_int(self.string(i)?),
            _ => 0,
        })
    }

    pub fn coerce_float(&self, value: &Value) -> Result<f32, Fault> {
        Ok(match *value {
            Value::Int(v) => v as f32,
            Value::Float(v) => v,
            Value::Str(i) => parse_leading_float(self.string(i)?),
            _ => 0.0,
        })
    }

    pub fn coerce_string(&self, value: &Value) -> Result<String, Fault> {
        Ok(match *value {
            Value::Int(v) => v.to_string(),
            Value::Float(v) => format!("{:.6}", v),
            Value::Str(i) => self.string(i)?.to_string(),
            _ => String::new(),
        })
    }

    // ═══════════════════════════════════════════════════════════════
    // Call protocol
    // ═══════════════════════════════════════════════════════════════

    /// Enter function `index`: push the return address (the current pc),
    /// reserve `locals + 1` slots with the frame pointer at the new top,
    /// write the bookkeeping record into the last slot and jump.
    pub(crate) fn enter_function(&mut self, index: u32) -> Result<(), Fault> {
        let (entry, locals) = {
            let func = self.function(index)?;
            (func.entry, func.local_data_size as usize)
        };
        let caller_frame = self.stack.frame();

        self.stack.push(Value::Instr(self.pc as u32))?;
        self.stack.push_frame(locals + 1)?;
        let top = self.stack.top();
        self.stack.put(
            top - 1,
            Value::Frame(FrameRecord {
                function: index,
                caller_frame,
            }),
        )?;

        self.pc = entry as usize;
        Ok(())
    }

    /// Stack pointers and pc before a blocking call to function `index`,
    /// with the arguments already pushed for it excluded (RET would have
    /// popped them too)
    pub(crate) fn checkpoint(&self, index: u32) -> Checkpoint {
        let params = self.function(index).map(|f| usize::from(f.param_count)).unwrap_or(0);
        Checkpoint {
            top: self.stack.top().saturating_sub(params),
            frame: self.stack.frame(),
            pc: self.pc,
        }
    }

    /// Throw away whatever a call left above `checkpoint`
    pub(crate) fn rewind(&mut self, checkpoint: Checkpoint) {
        self.stack.truncate(checkpoint.top, checkpoint.frame);
        self.pc = checkpoint.pc;
    }

    /// Turn the bookkeeping of the innermost call into a stack-base marker
    pub(crate) fn mark_stack_base(&mut self) -> Result<(), Fault> {
        let slot = self.stack.top().checked_sub(1).ok_or(Fault::CorruptFrame)?;
        match self.stack.at(slot)? {
            Value::Frame(record) => self.stack.put(slot, Value::StackBase(record)),
            _ => Err(Fault::CorruptFrame),
        }
    }

    /// Leave the current function. Returns true when the popped
    /// bookkeeping was a stack-base marker.
    pub(crate) fn leave_function(&mut self) -> Result<bool, Fault> {
        self.stack.pop_frame(self.stack.top() - self.stack.frame())?;
        let (record, stack_base) = self
            .stack
            .pop()?
            .frame_record()
            .ok_or(Fault::CorruptFrame)?;

        let (locals, frame_size) = {
            let func = self.function(record.function)?;
            (func.local_data_size as usize, func.stack_frame_size())
        };

        let slot = self
            .stack
            .top()
            .checked_sub(locals + 1)
            .ok_or(Fault::CorruptFrame)?;
        let return_address = match self.stack.at(slot)? {
            Value::Instr(address) => address as usize,
            _ => return Err(Fault::CorruptFrame),
        };

        self.stack.pop_frame(frame_size)?;
        self.stack.set_frame(record.caller_frame)?;
        self.pc = return_address;
        Ok(stack_base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ProgramBuilder;
    use crate::opcode::Opcode;

    fn script_with(globals: u32, locals: u32) -> Script {
        let mut b = ProgramBuilder::new();
        b.begin_function("Helper", 2, 3);
        b.emit(Opcode::Ret, &[]);
        b.begin_function("Main", 0, locals);
        b.emit(Opcode::Exit, &[Value::Int(0)]);
        let image = b.main("Main").global_data_size(globals).build();
        Script::from_image(image, None, &VmConfig::default()).unwrap()
    }

    #[test]
    fn test_string_table_interning() {
        let mut table = StringTable::from_strings(vec!["a".into(), "b".into()]);
        assert_eq!(table.intern("b"), 1);
        assert_eq!(table.intern("c"), 2);
        assert_eq!(table.intern("c"), 2);
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(2), Some("c"));
    }

    #[test]
    fn test_reset_layout() {
        let script = script_with(4, 2);
        assert_eq!(script.stack.top(), 4 + 2 + 1);
        assert_eq!(script.stack.frame(), script.stack.top());
        assert_eq!(script.pc, 1);
        assert!(!script.running);
    }

    #[test]
    fn test_reset_without_main() {
        let mut b = ProgramBuilder::new();
        b.emit(Opcode::Exit, &[Value::Int(0)]);
        let image = b.global_data_size(2).build();
        let script = Script::from_image(image, None, &VmConfig::default()).unwrap();
        assert_eq!(script.stack.top(), 3);
        assert_eq!(script.pc, 0);
    }

    #[test]
    fn test_priority_override_sets_timeslice() {
        let mut b = ProgramBuilder::new();
        b.user_timeslice(7);
        let image = b.build();
        let config = VmConfig::default();
        let script = Script::from_image(image.clone(), None, &config).unwrap();
        assert_eq!(script.timeslice_ms, 7);
        let script = Script::from_image(image, Some(Priority::High), &config).unwrap();
        assert_eq!(script.timeslice_ms, 80);
    }

    #[test]
    fn test_user_priority_keeps_the_header() {
        let config = VmConfig::default();
        let mut b = ProgramBuilder::new();
        b.priority(Priority::Medium);
        let script = Script::from_image(b.build(), Some(Priority::User), &config).unwrap();
        assert_eq!((script.priority, script.timeslice_ms), (Priority::Medium, 40));

        let mut b = ProgramBuilder::new();
        b.user_timeslice(15);
        let script = Script::from_image(b.build(), Some(Priority::User), &config).unwrap();
        assert_eq!((script.priority, script.timeslice_ms), (Priority::User, 15));
    }

    #[test]
    fn test_stack_limits() {
        let mut b = ProgramBuilder::new();
        b.stack_size(64);
        let config = VmConfig::default().with_max_stack_size(32);
        assert!(matches!(
            Script::from_image(b.build(), None, &config),
            Err(LoadError::OutOfMemory(_))
        ));

        let mut b = ProgramBuilder::new();
        b.stack_size(2).global_data_size(8);
        assert!(matches!(
            Script::from_image(b.build(), None, &VmConfig::default()),
            Err(LoadError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_coercions() {
        let mut script = script_with(0, 0);
        let s = script.strings.intern("12.5abc");
        assert_eq!(script.coerce_int(&Value::Float(3.9)).unwrap(), 3);
        assert_eq!(script.coerce_int(&Value::Str(s)).unwrap(), 12);
        assert_eq!(script.coerce_float(&Value::Str(s)).unwrap(), 12.5);
        assert_eq!(script.coerce_string(&Value::Float(1.5)).unwrap(), "1.500000");
        assert_eq!(script.coerce_string(&Value::Int(-4)).unwrap(), "-4");
        assert_eq!(script.coerce_int(&Value::Null).unwrap(), 0);
        assert_eq!(script.coerce_string(&Value::Instr(3)).unwrap(), "");
        assert_eq!(
            script.coerce_int(&Value::Str(99)),
            Err(Fault::InvalidString { index: 99 })
        );
    }

    #[test]
    fn test_call_protocol_balance() {
        let mut script = script_with(0, 0);
        let top0 = script.stack.top();
        let frame0 = script.stack.frame();
        script.stack.push(Value::Int(1)).unwrap();
        script.stack.push(Value::Int(2)).unwrap();
        script.pc = 42;

        script.enter_function(0).unwrap();
        assert_eq!(script.stack.top(), top0 + 2 + 1 + (3 + 1));
        assert_eq!(script.stack.frame(), script.stack.top());
        assert_eq!(script.pc, 0);

        assert!(!script.leave_function().unwrap());
        assert_eq!(script.stack.top(), top0);
        assert_eq!(script.stack.frame(), frame0);
        assert_eq!(script.pc, 42);
    }

    #[test]
    fn test_stack_base_marker() {
        let mut script = script_with(0, 0);
        script.enter_function(0).unwrap();
        script.mark_stack_base().unwrap();
        assert!(script.leave_function().unwrap());
    }

    #[test]
    fn test_corrupt_bookkeeping_faults() {
        let mut script = script_with(0, 0);
        script.enter_function(0).unwrap();
        let top = script.stack.top();
        script.stack.put(top - 1, Value::Int(0)).unwrap();
        assert_eq!(script.leave_function(), Err(Fault::CorruptFrame));
    }
}
