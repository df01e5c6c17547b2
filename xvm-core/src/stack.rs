//! Runtime stack
//!
//! Flat, preallocated array of [`Value`]s with a top pointer (next free
//! slot) and a frame pointer (top of the current function's frame).
//! `0 <= frame <= top <= size` holds after every operation.

use crate::error::Fault;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct RuntimeStack {
    elements: Vec<Value>,
    top: usize,
    frame: usize,
}

impl RuntimeStack {
    /// Stack of `size` Null slots
    pub fn new(size: usize) -> Self {
        Self {
            elements: vec![Value::Null; size],
            top: 0,
            frame: 0,
        }
    }

    /// Fallible allocation used by the loader
    pub fn try_new(size: usize) -> Option<Self> {
        let mut elements = Vec::new();
        elements.try_reserve_exact(size).ok()?;
        elements.resize(size, Value::Null);
        Some(Self {
            elements,
            top: 0,
            frame: 0,
        })
    }

    pub fn size(&self) -> usize {
        self.elements.len()
    }

    pub fn top(&self) -> usize {
        self.top
    }

    pub fn frame(&self) -> usize {
        self.frame
    }

    pub fn set_frame(&mut self, frame: usize) -> Result<(), Fault> {
        if frame > self.top {
            return Err(Fault::CorruptFrame);
        }
        self.frame = frame;
        Ok(())
    }

    /// Set every slot to Null and both pointers to 0
    pub fn clear(&mut self) {
        self.elements.fill(Value::Null);
        self.top = 0;
        self.frame = 0;
    }

    /// Map an operand index to an absolute slot: negative indices count
    /// down from the frame pointer
    pub fn resolve(&self, index: i32) -> Result<usize, Fault> {
        let absolute = if index < 0 {
            self.frame as i64 + i64::from(index)
        } else {
            i64::from(index)
        };
        if absolute < 0 || absolute >= self.elements.len() as i64 {
            return Err(Fault::StackOutOfRange {
                index: absolute,
                size: self.elements.len(),
            });
        }
        Ok(absolute as usize)
    }

    /// Absolute slot read
    pub fn at(&self, slot: usize) -> Result<Value, Fault> {
        self.elements
            .get(slot)
            .copied()
            .ok_or(Fault::StackOutOfRange {
                index: slot as i64,
                size: self.elements.len(),
            })
    }

    /// Absolute slot write
    pub fn put(&mut self, slot: usize, value: Value) -> Result<(), Fault> {
        let size = self.elements.len();
        let target = self.elements.get_mut(slot).ok_or(Fault::StackOutOfRange {
            index: slot as i64,
            size,
        })?;
        *target = value;
        Ok(())
    }

    /// Read through an operand-style index
    pub fn get(&self, index: i32) -> Result<Value, Fault> {
        self.at(self.resolve(index)?)
    }

    /// Write through an operand-style index
    pub fn set(&mut self, index: i32, value: Value) -> Result<(), Fault> {
        let slot = self.resolve(index)?;
        self.put(slot, value)
    }

    pub fn push(&mut self, value: Value) -> Result<(), Fault> {
        if self.top >= self.elements.len() {
            return Err(Fault::StackOverflow {
                size: self.elements.len(),
            });
        }
        self.elements[self.top] = value;
        self.top += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Value, Fault> {
        if self.top == 0 {
            return Err(Fault::StackUnderflow);
        }
        self.top -= 1;
        if self.frame > self.top {
            self.frame = self.top;
        }
        Ok(self.elements[self.top])
    }

    /// Reserve `size` slots and move the frame pointer to the new top
    pub fn push_frame(&mut self, size: usize) -> Result<(), Fault> {
        let new_top = self.top.checked_add(size).filter(|&t| t <= self.elements.len());
        let new_top = new_top.ok_or(Fault::StackOverflow {
            size: self.elements.len(),
        })?;
        self.top = new_top;
        self.frame = new_top;
        Ok(())
    }

    /// Release `size` slots; the frame pointer is restored by the caller
    pub fn pop_frame(&mut self, size: usize) -> Result<(), Fault> {
        self.top = self.top.checked_sub(size).ok_or(Fault::StackUnderflow)?;
        if self.frame > self.top {
            self.frame = self.top;
        }
        Ok(())
    }

    /// Drop everything above `top` and move the frame pointer to `frame`,
    /// clamped so the stack invariants hold
    pub fn truncate(&mut self, top: usize, frame: usize) {
        let top = top.min(self.elements.len());
        if top < self.top {
            self.elements[top..self.top].fill(Value::Null);
        }
        self.top = top;
        self.frame = frame.min(top);
    }

    /// Slots `0..top`, bottom first
    pub fn live(&self) -> &[Value] {
        &self.elements[..self.top]
    }
}
