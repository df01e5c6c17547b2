//! # ⚙️ xvm-core — XScript Virtual Machine
//!
//! Loads compiled XScript programs (`.XSE`), keeps one runtime context per
//! loaded script and interprets them under a cooperative, timeslice-based
//! scheduler with a bridge to native host callbacks.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  VirtualMachine                      │
//! │  ┌────────────────────────┐  ┌────────────────────┐  │
//! │  │ slots: [Option<Script>]│  │  HostApiRegistry   │  │
//! │  │  ┌──────────────────┐  │  │  name × scope → fn │  │
//! │  │  │ ProgramImage     │  │  └─────────▲──────────┘  │
//! │  │  │ StringTable      │  │            │ CALLHOST    │
//! │  │  │ RuntimeStack     │──┼── engine ──┘             │
//! │  │  │ pc, _RetVal      │  │                          │
//! │  │  └──────────────────┘  │  Scheduler (multi/single)│
//! │  └────────────────────────┘  Clock                   │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`value`]: tagged runtime values
//! - [`opcode`], [`instruction`]: the instruction set
//! - [`image`]: the `.XSE` binary format (loader and encoder)
//! - [`builder`]: programmatic image construction
//! - [`stack`]: the per-script runtime stack
//! - [`script`]: per-script context, coercions and the call protocol
//! - [`engine`]: instruction semantics
//! - [`scheduler`]: the run loop
//! - [`host`]: host API registration
//! - [`vm`]: the engine-facing API
//!
//! ## Quick Start
//!
//! ```
//! use xvm_core::{Budget, Opcode, ProgramBuilder, Value, VirtualMachine, VmConfig};
//!
//! let mut b = ProgramBuilder::new();
//! b.begin_function("Main", 0, 1);
//! b.emit(Opcode::Mov, &[Value::AbsStack(-2), Value::Int(1)]);
//! b.emit(Opcode::Add, &[Value::AbsStack(-2), Value::Int(2)]);
//! b.emit(Opcode::Exit, &[Value::AbsStack(-2)]);
//!
//! let mut vm = VirtualMachine::with_config(VmConfig::default());
//! let slot = vm.load_bytes(&b.main("Main").to_bytes(), None).unwrap();
//! vm.start(slot).unwrap();
//! vm.run(Budget::Infinite).unwrap();
//! assert_eq!(vm.exit_code(slot).unwrap(), Some(3));
//! ```

pub mod builder;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod image;
pub mod instruction;
pub mod opcode;
pub mod scheduler;
pub mod script;
pub mod stack;
pub mod value;
pub mod vm;

/// Index into the fixed script slot table
pub type SlotIndex = usize;

pub use builder::ProgramBuilder;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{VM_CONFIG, VmConfig};
pub use engine::Effect;
pub use error::{Fault, LoadError, VmError, VmResult};
pub use host::{HostApiRegistry, HostFunction, HostScope};
pub use image::{Function, Priority, ProgramImage, XSE_MAGIC, XSE_VERSION_MAJOR, XSE_VERSION_MINOR, XseHeader};
pub use instruction::Instruction;
pub use opcode::{Opcode, OpcodeCategory};
pub use scheduler::{Budget, RunOutcome, ThreadMode};
pub use script::{Script, StringTable};
pub use stack::RuntimeStack;
pub use value::{FrameRecord, Value};
pub use vm::{ScriptStatus, VirtualMachine};
