//! Execution engine
//!
//! Fetch, decode and execute one instruction of a [`Script`]. Operands are
//! copied out of the instruction and resolved against the live stack right
//! before use; nothing is cached across instructions.
//!
//! ```text
//!   pc ──► Instruction ──► Operands[0..3] ──► resolve ──► op_* handler
//!                                                 │
//!                          AbsStack / RelStack ───┤──► stack slot
//!                          Reg ───────────────────┤──► _RetVal
//!                          literal ───────────────┘──► value itself
//! ```
//!
//! Handlers report what the scheduler has to do next through [`Effect`];
//! everything that needs the whole VM (host calls, stack-base returns) is
//! deferred to it.

use crate::error::Fault;
use crate::instruction::MAX_OPERANDS;
use crate::opcode::Opcode;
use crate::script::Script;
use crate::value::Value;
use std::cmp::Ordering;

/// Outcome of one executed instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Nothing beyond the state change itself
    Continue,
    /// CALLHOST: invoke the named host API for this script
    CallHost(String),
    /// RET popped a stack-base marker: the run loop must stop
    StackBaseReturn,
}

/// Operands copied out of the current instruction
#[derive(Debug, Clone, Copy)]
struct Operands {
    values: [Value; MAX_OPERANDS],
    len: usize,
}

impl Operands {
    fn get(&self, index: usize) -> Result<Value, Fault> {
        if index >= self.len {
            return Err(Fault::MissingOperand {
                index,
                count: self.len,
            });
        }
        Ok(self.values[index])
    }
}

/// Writable location named by an operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Stack(usize),
    Register,
}

/// Program-counter update after a handler
enum Flow {
    Next,
    Jump(usize),
}

impl Script {
    /// Execute the instruction at the program counter.
    ///
    /// `now_ms` is the scheduler's time for this step (used by PAUSE).
    pub fn execute(&mut self, now_ms: u64) -> Result<Effect, Fault> {
        let (opcode, ops) = self.fetch()?;
        let mut effect = Effect::Continue;

        let flow = match opcode {
            Opcode::Mov => self.op_mov(&ops)?,
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Exp
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Shl
            | Opcode::Shr => self.op_binary(opcode, &ops)?,
            Opcode::Neg | Opcode::Inc | Opcode::Dec | Opcode::Not => self.op_unary(opcode, &ops)?,
            Opcode::Concat => self.op_concat(&ops)?,
            Opcode::GetChar => self.op_getchar(&ops)?,
            Opcode::SetChar => self.op_setchar(&ops)?,
            Opcode::Jmp => Flow::Jump(self.jump_target(&ops, 0)?),
            Opcode::Je | Opcode::Jne | Opcode::Jg | Opcode::Jl | Opcode::Jge | Opcode::Jle => {
                self.op_branch(opcode, &ops)?
            }
            Opcode::Push => {
                let value = self.read(&ops, 0)?;
                self.stack.push(value)?;
                Flow::Next
            }
            Opcode::Pop => {
                let value = self.stack.pop()?;
                self.write(&ops, 0, value)?;
                Flow::Next
            }
            Opcode::Call => {
                let index = match self.read(&ops, 0)? {
                    Value::Func(index) => index,
                    other => return Err(mismatch(0, "func", &other)),
                };
                // return address is the instruction after CALL
                self.pc += 1;
                self.enter_function(index)?;
                self.executed += 1;
                return Ok(effect);
            }
            Opcode::Ret => {
                if self.leave_function()? {
                    effect = Effect::StackBaseReturn;
                }
                self.executed += 1;
                return Ok(effect);
            }
            Opcode::CallHost => {
                let index = match self.read(&ops, 0)? {
                    Value::HostApi(index) => index,
                    other => return Err(mismatch(0, "host", &other)),
                };
                let name = self
                    .image
                    .host_apis
                    .get(index as usize)
                    .ok_or(Fault::InvalidHostApi { index })?;
                effect = Effect::CallHost(name.clone());
                Flow::Next
            }
            Opcode::Pause => {
                let duration = self.read(&ops, 0).and_then(|v| self.coerce_int(&v))?;
                self.paused = true;
                self.pause_end = now_ms.saturating_add(duration.max(0) as u64);
                Flow::Next
            }
            Opcode::Exit => {
                let code = self.read(&ops, 0).and_then(|v| self.coerce_int(&v))?;
                self.running = false;
                self.exit_code = Some(code);
                Flow::Next
            }
        };

        self.pc = match flow {
            Flow::Next => self.pc + 1,
            Flow::Jump(target) => target,
        };
        self.executed += 1;
        Ok(effect)
    }

    fn fetch(&self) -> Result<(Opcode, Operands), Fault> {
        let instr = self.instruction(self.pc)?;
        let mut ops = Operands {
            values: [Value::Null; MAX_OPERANDS],
            len: instr.operands.len().min(MAX_OPERANDS),
        };
        ops.values[..ops.len].copy_from_slice(&instr.operands[..ops.len]);
        Ok((instr.opcode, ops))
    }

    // ═══════════════════════════════════════════════════════════════
    // Operand resolution
    // ═══════════════════════════════════════════════════════════════

    fn locate(&self, operand: Value) -> Result<Option<Location>, Fault> {
        match operand {
            Value::AbsStack(index) => Ok(Some(Location::Stack(self.stack.resolve(index)?))),
            Value::RelStack { base, offset } => {
                let offset_value = self.stack.get(offset)?;
                let index = base.wrapping_add(self.coerce_int(&offset_value)?);
                Ok(Some(Location::Stack(self.stack.resolve(index)?)))
            }
            Value::Reg(_) => Ok(Some(Location::Register)),
            _ => Ok(None),
        }
    }

    fn load(&self, location: Location) -> Result<Value, Fault> {
        match location {
            Location::Stack(slot) => self.stack.at(slot),
            Location::Register => Ok(self.ret_val),
        }
    }

    /// Value of operand `index`: stack contents, register, or the literal
    fn read(&self, ops: &Operands, index: usize) -> Result<Value, Fault> {
        let operand = ops.get(index)?;
        match self.locate(operand)? {
            Some(location) => self.load(location),
            None => Ok(operand),
        }
    }

    fn write(&mut self, ops: &Operands, index: usize, value: Value) -> Result<(), Fault> {
        match self.locate(ops.get(index)?)? {
            Some(Location::Stack(slot)) => self.stack.put(slot, value),
            Some(Location::Register) => {
                self.ret_val = value;
                Ok(())
            }
            None => Err(Fault::NotWritable { index }),
        }
    }

    fn jump_target(&self, ops: &Operands, index: usize) -> Result<usize, Fault> {
        match self.read(ops, index)? {
            Value::Instr(target) if (target as usize) < self.image.instructions.len() => {
                Ok(target as usize)
            }
            Value::Instr(target) => Err(Fault::InstructionOutOfRange {
                index: u64::from(target),
                count: self.image.instructions.len(),
            }),
            other => Err(mismatch(index, "instr", &other)),
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Handlers
    // ═══════════════════════════════════════════════════════════════

    fn op_mov(&mut self, ops: &Operands) -> Result<Flow, Fault> {
        let dest = self.locate(ops.get(0)?)?;
        let source = self.locate(ops.get(1)?)?;
        if dest.is_some() && dest == source {
            return Ok(Flow::Next);
        }
        let value = self.read(ops, 1)?;
        self.write(ops, 0, value)?;
        Ok(Flow::Next)
    }

    fn op_binary(&mut self, opcode: Opcode, ops: &Operands) -> Result<Flow, Fault> {
        let dest = self.read(ops, 0)?;
        let source = self.read(ops, 1)?;

        let result = match dest {
            Value::Int(a) => {
                let b = self.coerce_int(&source)?;
                Some(Value::Int(int_binary(opcode, a, b)?))
            }
            _ => match opcode {
                // integer-only operations leave other types untouched
                Opcode::Mod | Opcode::And | Opcode::Or | Opcode::Xor | Opcode::Shl | Opcode::Shr => {
                    None
                }
                _ => {
                    let a = self.coerce_float(&dest)?;
                    let b = self.coerce_float(&source)?;
                    Some(Value::Float(float_binary(opcode, a, b)))
                }
            },
        };

        if let Some(value) = result {
            self.write(ops, 0, value)?;
        }
        Ok(Flow::Next)
    }

    fn op_unary(&mut self, opcode: Opcode, ops: &Operands) -> Result<Flow, Fault> {
        let dest = self.read(ops, 0)?;
        let result = match (opcode, dest) {
            (Opcode::Neg, Value::Int(a)) => Some(Value::Int(a.wrapping_neg())),
            (Opcode::Inc, Value::Int(a)) => Some(Value::Int(a.wrapping_add(1))),
            (Opcode::Dec, Value::Int(a)) => Some(Value::Int(a.wrapping_sub(1))),
            (Opcode::Not, Value::Int(a)) => Some(Value::Int(!a)),
            (Opcode::Not, _) => None,
            (Opcode::Neg, other) => Some(Value::Float(-self.coerce_float(&other)?)),
            (Opcode::Inc, other) => Some(Value::Float(self.coerce_float(&other)? + 1.0)),
            (_, other) => Some(Value::Float(self.coerce_float(&other)? - 1.0)),
        };
        if let Some(value) = result {
            self.write(ops, 0, value)?;
        }
        Ok(Flow::Next)
    }

    fn op_concat(&mut self, ops: &Operands) -> Result<Flow, Fault> {
        let Value::Str(index) = self.read(ops, 0)? else {
            return Ok(Flow::Next);
        };
        let suffix = self.read(ops, 1).and_then(|v| self.coerce_string(&v))?;
        let joined = format!("{}{}", self.string(index)?, suffix);
        let interned = self.strings.intern(&joined);
        self.write(ops, 0, Value::Str(interned))?;
        Ok(Flow::Next)
    }

    fn op_getchar(&mut self, ops: &Operands) -> Result<Flow, Fault> {
        let text = self.read(ops, 1).and_then(|v| self.coerce_string(&v))?;
        let index = self.read(ops, 2).and_then(|v| self.coerce_int(&v))?;
        let ch = char_at(&text, index)?;
        let interned = self.strings.intern(ch.encode_utf8(&mut [0u8; 4]));
        self.write(ops, 0, Value::Str(interned))?;
        Ok(Flow::Next)
    }

    /// Copy-on-write: the edited text is interned as a new string and only
    /// the operand's location is repointed
    fn op_setchar(&mut self, ops: &Operands) -> Result<Flow, Fault> {
        let Value::Str(target) = self.read(ops, 0)? else {
            return Ok(Flow::Next);
        };
        let index = self.read(ops, 1).and_then(|v| self.coerce_int(&v))?;
        let source = self.read(ops, 2).and_then(|v| self.coerce_string(&v))?;
        let Some(replacement) = source.chars().next() else {
            return Ok(Flow::Next);
        };

        let text = self.string(target)?;
        char_at(text, index)?;
        let edited: String = text
            .chars()
            .enumerate()
            .map(|(i, c)| if i == index as usize { replacement } else { c })
            .collect();

        let interned = self.strings.intern(&edited);
        self.write(ops, 0, Value::Str(interned))?;
        Ok(Flow::Next)
    }

    fn op_branch(&mut self, opcode: Opcode, ops: &Operands) -> Result<Flow, Fault> {
        let a = self.read(ops, 0)?;
        let b = self.read(ops, 1)?;
        let target = self.jump_target(ops, 2)?;

        let taken = match a {
            Value::Int(x) => ordering_matches(opcode, Some(x.cmp(&self.coerce_int(&b)?))),
            Value::Float(x) => ordering_matches(opcode, x.partial_cmp(&self.coerce_float(&b)?)),
            Value::Str(index) => match opcode {
                Opcode::Je | Opcode::Jne => {
                    let equal = self.string(index)? == self.coerce_string(&b)?;
                    equal == (opcode == Opcode::Je)
                }
                // relational comparisons on strings never jump
                _ => false,
            },
            _ => false,
        };

        Ok(if taken { Flow::Jump(target) } else { Flow::Next })
    }
}

fn mismatch(index: usize, expected: &'static str, found: &Value) -> Fault {
    Fault::TypeMismatch {
        index,
        expected,
        found: found.type_name(),
    }
}

fn char_at(text: &str, index: i32) -> Result<char, Fault> {
    let out_of_range = || Fault::CharOutOfRange {
        index,
        len: text.chars().count(),
    };
    if index < 0 {
        return Err(out_of_range());
    }
    text.chars().nth(index as usize).ok_or_else(out_of_range)
}

fn int_binary(opcode: Opcode, a: i32, b: i32) -> Result<i32, Fault> {
    Ok(match opcode {
        Opcode::Add => a.wrapping_add(b),
        Opcode::Sub => a.wrapping_sub(b),
        Opcode::Mul => a.wrapping_mul(b),
        Opcode::Div if b == 0 => return Err(Fault::DivisionByZero),
        Opcode::Div => a.wrapping_div(b),
        Opcode::Mod if b == 0 => return Err(Fault::DivisionByZero),
        Opcode::Mod => a.wrapping_rem(b),
        Opcode::Exp => f64::from(a).powf(f64::from(b)) as i32,
        Opcode::And => a & b,
        Opcode::Or => a | b,
        Opcode::Xor => a ^ b,
        Opcode::Shl => a.wrapping_shl(b as u32),
        Opcode::Shr => a.wrapping_shr(b as u32),
        _ => a,
    })
}

fn float_binary(opcode: Opcode, a: f32, b: f32) -> f32 {
    match opcode {
        Opcode::Add => a + b,
        Opcode::Sub => a - b,
        Opcode::Mul => a * b,
        Opcode::Div => a / b,
        Opcode::Exp => a.powf(b),
        _ => a,
    }
}

/// NaN compares as unordered and only satisfies JNE
fn ordering_matches(opcode: Opcode, ordering: Option<Ordering>) -> bool {
    match (opcode, ordering) {
        (Opcode::Jne, None) => true,
        (_, None) => false,
        (Opcode::Je, Some(o)) => o == Ordering::Equal,
        (Opcode::Jne, Some(o)) => o != Ordering::Equal,
        (Opcode::Jg, Some(o)) => o == Ordering::Greater,
        (Opcode::Jl, Some(o)) => o == Ordering::Less,
        (Opcode::Jge, Some(o)) => o != Ordering::Less,
        (Opcode::Jle, Some(o)) => o != Ordering::Greater,
        _ => false,
    }
}
