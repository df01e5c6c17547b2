//! Engine-facing API
//!
//! [`VirtualMachine`] owns the fixed slot table, the host API registry and
//! the scheduler state. Everything a host program does goes through it:
//! loading, lifecycle control, parameter passing, synchronous calls into
//! scripts, and the helpers host callbacks use to read their arguments.

use crate::SlotIndex;
use crate::clock::{Clock, SystemClock};
use crate::config::{VM_CONFIG, VmConfig};
use crate::error::{Fault, LoadError, VmError, VmResult};
use crate::host::{HostApiRegistry, HostFunction, HostScope};
use crate::image::{Priority, ProgramImage};
use crate::scheduler::{Budget, RunOutcome, ThreadMode};
use crate::script::Script;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Serializable snapshot of one script slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptStatus {
    pub slot: SlotIndex,
    pub running: bool,
    pub paused: bool,
    pub pc: usize,
    pub stack_top: usize,
    pub frame: usize,
    pub stack_size: usize,
    pub priority: Priority,
    pub timeslice_ms: u64,
    pub exit_code: Option<i32>,
    pub executed: u64,
    pub instructions: usize,
    pub functions: usize,
    pub strings: usize,
}

/// XScript virtual machine
pub struct VirtualMachine {
    pub(crate) config: VmConfig,
    pub(crate) slots: Vec<Option<Script>>,
    pub(crate) host_apis: HostApiRegistry,
    pub(crate) current: SlotIndex,
    pub(crate) mode: ThreadMode,
    /// When the current slot got the CPU
    pub(crate) active_since: u64,
    pub(crate) clock: Arc<dyn Clock>,
}

impl Default for VirtualMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualMachine {
    /// Engine configured from the environment, on the system clock
    pub fn new() -> Self {
        Self::with_config(VM_CONFIG.clone())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(config: VmConfig, clock: Arc<dyn Clock>) -> Self {
        let mut slots = Vec::with_capacity(config.max_scripts);
        slots.resize_with(config.max_scripts, || None);
        Self {
            host_apis: HostApiRegistry::new(config.max_host_apis),
            slots,
            current: 0,
            mode: ThreadMode::Multi,
            active_since: 0,
            clock,
            config,
        }
    }

    /// Unload every script and drop every host registration
    pub fn shutdown(&mut self) {
        let mut unloaded = 0;
        for slot in self.slots.iter_mut() {
            if slot.take().is_some() {
                unloaded += 1;
            }
        }
        self.host_apis.clear();
        self.current = 0;
        self.mode = ThreadMode::Multi;
        tracing::info!(unloaded, "virtual machine shut down");
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ═══════════════════════════════════════════════════════════════
    // Loading
    // ═══════════════════════════════════════════════════════════════

    fn free_slot(&self) -> Result<SlotIndex, LoadError> {
        self.slots
            .iter()
            .position(Option::is_none)
            .ok_or(LoadError::OutOfThreads)
    }

    /// Load a program from its binary form into a free slot.
    ///
    /// `priority` overrides the one stored in the program.
    pub fn load_bytes(&mut self, bytes: &[u8], priority: Option<Priority>) -> VmResult<SlotIndex> {
        let slot = self.free_slot()?;
        let image = ProgramImage::from_bytes(bytes)?;
        self.install(slot, image, priority)
    }

    /// Load a program file into a free slot
    pub fn load_file(&mut self, path: impl AsRef<Path>, priority: Option<Priority>) -> VmResult<SlotIndex> {
        let slot = self.free_slot()?;
        let image = ProgramImage::load(path.as_ref())?;
        self.install(slot, image, priority)
    }

    /// Load an already parsed image into a free slot
    pub fn load_image(&mut self, image: ProgramImage, priority: Option<Priority>) -> VmResult<SlotIndex> {
        let slot = self.free_slot()?;
        self.install(slot, image, priority)
    }

    fn install(&mut self, slot: SlotIndex, image: ProgramImage, priority: Option<Priority>) -> VmResult<SlotIndex> {
        let script = Script::from_image(image, priority, &self.config)?;
        tracing::info!(
            slot,
            instructions = script.image.instructions.len(),
            functions = script.image.functions.len(),
            stack = script.stack.size(),
            priority = %script.priority,
            "script loaded"
        );
        self.slots[slot] = Some(script);
        Ok(slot)
    }

    /// Free a slot and drop the host APIs registered for it
    pub fn unload(&mut self, slot: SlotIndex) -> VmResult<()> {
        self.script(slot)?;
        self.slots[slot] = None;
        self.host_apis.remove_scope(slot);
        tracing::info!(slot, "script unloaded");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // Slot access
    // ═══════════════════════════════════════════════════════════════

    pub fn script(&self, slot: SlotIndex) -> VmResult<&Script> {
        self.slots
            .get(slot)
            .ok_or(VmError::InvalidSlot(slot))?
            .as_ref()
            .ok_or(VmError::InactiveSlot(slot))
    }

    pub(crate) fn script_mut(&mut self, slot: SlotIndex) -> VmResult<&mut Script> {
        self.slots
            .get_mut(slot)
            .ok_or(VmError::InvalidSlot(slot))?
            .as_mut()
            .ok_or(VmError::InactiveSlot(slot))
    }

    pub fn is_active(&self, slot: SlotIndex) -> bool {
        matches!(self.slots.get(slot), Some(Some(_)))
    }

    /// Indices of every loaded script
    pub fn active_slots(&self) -> Vec<SlotIndex> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect()
    }

    /// Attach slot and instruction to a fault raised outside the run loop
    fn fault(&self, slot: SlotIndex, fault: Fault) -> VmError {
        let instr = self.script(slot).map(|s| s.pc).unwrap_or(0);
        VmError::Fault { slot, instr, fault }
    }

    // ═══════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════

    pub fn reset(&mut self, slot: SlotIndex) -> VmResult<()> {
        let result = self.script_mut(slot)?.reset();
        result.map_err(|fault| self.fault(slot, fault))?;
        tracing::debug!(slot, "script reset");
        Ok(())
    }

    /// Mark a script running and hand it the CPU
    pub fn start(&mut self, slot: SlotIndex) -> VmResult<()> {
        self.script_mut(slot)?.running = true;
        self.current = slot;
        self.active_since = self.clock.now_ms();
        tracing::debug!(slot, "script started");
        Ok(())
    }

    pub fn stop(&mut self, slot: SlotIndex) -> VmResult<()> {
        self.script_mut(slot)?.running = false;
        tracing::debug!(slot, "script stopped");
        Ok(())
    }

    /// Suspend a script for `duration_ms` milliseconds
    pub fn pause(&mut self, slot: SlotIndex, duration_ms: u64) -> VmResult<()> {
        let now = self.clock.now_ms();
        let script = self.script_mut(slot)?;
        script.paused = true;
        script.pause_end = now.saturating_add(duration_ms);
        tracing::debug!(slot, until = script.pause_end, "script paused");
        Ok(())
    }

    pub fn unpause(&mut self, slot: SlotIndex) -> VmResult<()> {
        self.script_mut(slot)?.paused = false;
        tracing::debug!(slot, "script unpaused");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // Parameters and return values
    // ═══════════════════════════════════════════════════════════════

    fn push_param(&mut self, slot: SlotIndex, value: Value) -> VmResult<()> {
        let result = self.script_mut(slot)?.stack.push(value);
        result.map_err(|fault| self.fault(slot, fault))
    }

    pub fn pass_int_param(&mut self, slot: SlotIndex, value: i32) -> VmResult<()> {
        self.push_param(slot, Value::Int(value))
    }

    pub fn pass_float_param(&mut self, slot: SlotIndex, value: f32) -> VmResult<()> {
        self.push_param(slot, Value::Float(value))
    }

    /// Interned into the target script's string table
    pub fn pass_string_param(&mut self, slot: SlotIndex, value: &str) -> VmResult<()> {
        let index = self.script_mut(slot)?.strings.intern(value);
        self.push_param(slot, Value::Str(index))
    }

    pub fn return_as_int(&self, slot: SlotIndex) -> VmResult<i32> {
        let script = self.script(slot)?;
        script
            .coerce_int(&script.ret_val)
            .map_err(|fault| self.fault(slot, fault))
    }

    pub fn return_as_float(&self, slot: SlotIndex) -> VmResult<f32> {
        let script = self.script(slot)?;
        script
            .coerce_float(&script.ret_val)
            .map_err(|fault| self.fault(slot, fault))
    }

    pub fn return_as_string(&self, slot: SlotIndex) -> VmResult<String> {
        let script = self.script(slot)?;
        script
            .coerce_string(&script.ret_val)
            .map_err(|fault| self.fault(slot, fault))
    }

    // ═══════════════════════════════════════════════════════════════
    // Host callback helpers
    // ═══════════════════════════════════════════════════════════════

    /// Argument `param_index` of the current host call (0 = last pushed)
    fn param(&self, slot: SlotIndex, param_index: usize) -> VmResult<(&Script, Value)> {
        let script = self.script(slot)?;
        let value = script
            .stack
            .top()
            .checked_sub(param_index + 1)
            .ok_or(Fault::StackUnderflow)
            .and_then(|index| script.stack.at(index))
            .map_err(|fault| self.fault(slot, fault))?;
        Ok((script, value))
    }

    pub fn param_as_int(&self, slot: SlotIndex, param_index: usize) -> VmResult<i32> {
        let (script, value) = self.param(slot, param_index)?;
        script.coerce_int(&value).map_err(|fault| self.fault(slot, fault))
    }

    pub fn param_as_float(&self, slot: SlotIndex, param_index: usize) -> VmResult<f32> {
        let (script, value) = self.param(slot, param_index)?;
        script.coerce_float(&value).map_err(|fault| self.fault(slot, fault))
    }

    pub fn param_as_string(&self, slot: SlotIndex, param_index: usize) -> VmResult<String> {
        let (script, value) = self.param(slot, param_index)?;
        script.coerce_string(&value).map_err(|fault| self.fault(slot, fault))
    }

    /// Pop the `param_count` arguments of a host call
    pub fn return_from_host(&mut self, slot: SlotIndex, param_count: usize) -> VmResult<()> {
        let result = self.script_mut(slot)?.stack.pop_frame(param_count);
        result.map_err(|fault| self.fault(slot, fault))
    }

    pub fn return_int_from_host(&mut self, slot: SlotIndex, param_count: usize, value: i32) -> VmResult<()> {
        self.return_from_host(slot, param_count)?;
        self.script_mut(slot)?.ret_val = Value::Int(value);
        Ok(())
    }

    pub fn return_float_from_host(&mut self, slot: SlotIndex, param_count: usize, value: f32) -> VmResult<()> {
        self.return_from_host(slot, param_count)?;
        self.script_mut(slot)?.ret_val = Value::Float(value);
        Ok(())
    }

    pub fn return_string_from_host(&mut self, slot: SlotIndex, param_count: usize, value: &str) -> VmResult<()> {
        self.return_from_host(slot, param_count)?;
        let script = self.script_mut(slot)?;
        let index = script.strings.intern(value);
        script.ret_val = Value::Str(index);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // Host API registration
    // ═══════════════════════════════════════════════════════════════

    /// Make `function` callable through CALLHOST under `name`
    pub fn register_host_api<F>(&mut self, name: &str, scope: HostScope, function: F) -> VmResult<()>
    where
        F: Fn(&mut VirtualMachine, SlotIndex) -> VmResult<()> + Send + Sync + 'static,
    {
        let function: HostFunction = Arc::new(function);
        self.host_apis.register(name, scope, function)?;
        tracing::debug!(name, %scope, "host API registered");
        Ok(())
    }

    pub fn unregister_host_api(&mut self, name: &str, scope: HostScope) -> bool {
        let removed = self.host_apis.unregister(name, scope);
        if removed {
            tracing::debug!(name, %scope, "host API unregistered");
        }
        removed
    }

    pub fn host_apis(&self) -> &HostApiRegistry {
        &self.host_apis
    }

    // ═══════════════════════════════════════════════════════════════
    // Calls into scripts
    // ═══════════════════════════════════════════════════════════════

    fn function_index(&self, slot: SlotIndex, name: &str) -> VmResult<u32> {
        self.script(slot)?
            .image
            .find_function(name)
            .map(|(index, _)| index)
            .ok_or_else(|| VmError::FunctionNotFound {
                slot,
                name: name.to_string(),
            })
    }

    /// Run function `name` to completion before returning.
    ///
    /// Other scripts are frozen for the duration. The target runs even if
    /// it was never started; afterwards its running flag is what it was
    /// before the call, unless the call stopped it (EXIT or a fault). If the
    /// function does not return normally, its frame and arguments are
    /// discarded and the stack and pc go back to where they were. Read the
    /// result with [`return_as_int`](Self::return_as_int) and friends.
    pub fn call_function(&mut self, slot: SlotIndex, name: &str) -> VmResult<()> {
        let index = self.function_index(slot, name)?;

        let saved = (self.current, self.mode, self.active_since);
        let (was_running, checkpoint) = {
            let script = self.script_mut(slot)?;
            let was_running = script.running;
            script.running = true;
            (was_running, script.checkpoint(index))
        };

        let entered = {
            let script = self.script_mut(slot)?;
            script
                .enter_function(index)
                .and_then(|_| script.mark_stack_base())
        };
        if let Err(fault) = entered {
            let script = self.script_mut(slot)?;
            script.rewind(checkpoint);
            script.running = was_running;
            return Err(self.fault(slot, fault));
        }

        tracing::debug!(slot, function = name, "blocking call");
        self.current = slot;
        self.mode = ThreadMode::Single;
        let outcome = self.run(Budget::Infinite);
        (self.current, self.mode, self.active_since) = saved;

        // a host callback may have unloaded the script meanwhile
        if let Some(Some(script)) = self.slots.get_mut(slot) {
            if !matches!(outcome, Ok(RunOutcome::StackBaseReturned)) {
                script.rewind(checkpoint);
                tracing::debug!(slot, function = name, "blocking call unwound");
            }
            script.running = was_running && script.running;
        }
        outcome.map(|_| ())
    }

    /// Enter function `name` and return immediately; it runs as part of the
    /// script's normal scheduling
    pub fn invoke_function(&mut self, slot: SlotIndex, name: &str) -> VmResult<()> {
        let index = self.function_index(slot, name)?;
        let result = self.script_mut(slot)?.enter_function(index);
        result.map_err(|fault| self.fault(slot, fault))?;
        tracing::debug!(slot, function = name, "function invoked");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // Introspection
    // ═══════════════════════════════════════════════════════════════

    pub fn status(&self, slot: SlotIndex) -> VmResult<ScriptStatus> {
        let script = self.script(slot)?;
        Ok(ScriptStatus {
            slot,
            running: script.running,
            paused: script.paused,
            pc: script.pc,
            stack_top: script.stack.top(),
            frame: script.stack.frame(),
            stack_size: script.stack.size(),
            priority: script.priority,
            timeslice_ms: script.timeslice_ms,
            exit_code: script.exit_code,
            executed: script.executed,
            instructions: script.image.instructions.len(),
            functions: script.image.functions.len(),
            strings: script.strings.len(),
        })
    }

    /// Status of every loaded script
    pub fn statuses(&self) -> Vec<ScriptStatus> {
        self.active_slots()
            .into_iter()
            .filter_map(|slot| self.status(slot).ok())
            .collect()
    }

    /// Code passed to the last EXIT, if the script has exited
    pub fn exit_code(&self, slot: SlotIndex) -> VmResult<Option<i32>> {
        Ok(self.script(slot)?.exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ProgramBuilder;
    use crate::opcode::Opcode;

    fn small_vm() -> VirtualMachine {
        VirtualMachine::with_config(VmConfig::default().with_max_scripts(2))
    }

    fn exit_program(code: i32) -> Vec<u8> {
        let mut b = ProgramBuilder::new();
        b.begin_function("Main", 0, 0);
        b.emit(Opcode::Exit, &[Value::Int(code)]);
        b.main("Main").to_bytes()
    }

    #[test]
    fn test_slots_fill_up() {
        let mut vm = small_vm();
        assert_eq!(vm.load_bytes(&exit_program(0), None).unwrap(), 0);
        assert_eq!(vm.load_bytes(&exit_program(0), None).unwrap(), 1);
        assert_eq!(
            vm.load_bytes(&exit_program(0), None),
            Err(VmError::Load(LoadError::OutOfThreads))
        );
        vm.unload(0).unwrap();
        assert_eq!(vm.load_bytes(&exit_program(0), None).unwrap(), 0);
    }

    #[test]
    fn test_out_of_threads_before_parsing() {
        let mut vm = VirtualMachine::with_config(VmConfig::default().with_max_scripts(0));
        assert_eq!(
            vm.load_bytes(b"garbage", None),
            Err(VmError::Load(LoadError::OutOfThreads))
        );
        assert_eq!(
            vm.load_file("/definitely/not/here.xse", None),
            Err(VmError::Load(LoadError::OutOfThreads))
        );
    }

    #[test]
    fn test_missing_file_is_file_io() {
        let mut vm = small_vm();
        assert!(matches!(
            vm.load_file("/definitely/not/here.xse", None),
            Err(VmError::Load(LoadError::FileIo(_)))
        ));
    }

    #[test]
    fn test_inactive_and_invalid_slots() {
        let mut vm = small_vm();
        assert_eq!(vm.start(1), Err(VmError::InactiveSlot(1)));
        assert_eq!(vm.start(7), Err(VmError::InvalidSlot(7)));
        assert_eq!(vm.unload(0), Err(VmError::InactiveSlot(0)));
        assert!(vm.status(0).is_err());
    }

    #[test]
    fn test_unload_drops_scoped_host_apis() {
        let mut vm = small_vm();
        let slot = vm.load_bytes(&exit_program(0), None).unwrap();
        vm.register_host_api("Mine", HostScope::Script(slot), |_, _| Ok(()))
            .unwrap();
        vm.register_host_api("Shared", HostScope::Global, |_, _| Ok(()))
            .unwrap();
        vm.unload(slot).unwrap();
        assert_eq!(vm.host_apis().len(), 1);
    }

    #[test]
    fn test_params_and_host_returns() {
        let mut vm = small_vm();
        let slot = vm.load_bytes(&exit_program(0), None).unwrap();
        let top = vm.status(slot).unwrap().stack_top;

        vm.pass_int_param(slot, 4).unwrap();
        vm.pass_float_param(slot, 2.5).unwrap();
        vm.pass_string_param(slot, "hi").unwrap();
        assert_eq!(vm.param_as_string(slot, 0).unwrap(), "hi");
        assert_eq!(vm.param_as_float(slot, 1).unwrap(), 2.5);
        assert_eq!(vm.param_as_int(slot, 2).unwrap(), 4);

        vm.return_string_from_host(slot, 3, "done").unwrap();
        assert_eq!(vm.status(slot).unwrap().stack_top, top);
        assert_eq!(vm.return_as_string(slot).unwrap(), "done");

        vm.return_float_from_host(slot, 0, 1.25).unwrap();
        assert_eq!(vm.return_as_int(slot).unwrap(), 1);
        assert_eq!(vm.return_as_float(slot).unwrap(), 1.25);
    }

    #[test]
    fn test_string_param_goes_to_target_table() {
        let mut vm = small_vm();
        let a = vm.load_bytes(&exit_program(0), None).unwrap();
        let b = vm.load_bytes(&exit_program(0), None).unwrap();
        vm.start(a).unwrap();
        vm.pass_string_param(b, "only in b").unwrap();
        assert_eq!(vm.script(a).unwrap().strings().len(), 0);
        assert_eq!(vm.script(b).unwrap().strings().len(), 1);
    }

    #[test]
    fn test_unknown_function() {
        let mut vm = small_vm();
        let slot = vm.load_bytes(&exit_program(0), None).unwrap();
        assert_eq!(
            vm.invoke_function(slot, "Nope"),
            Err(VmError::FunctionNotFound {
                slot,
                name: "Nope".into()
            })
        );
        assert!(vm.call_function(slot, "Nope").is_err());
    }

    #[test]
    fn test_status_serializes() {
        let mut vm = small_vm();
        let slot = vm.load_bytes(&exit_program(5), Some(Priority::Medium)).unwrap();
        let json = serde_json::to_string(&vm.status(slot).unwrap()).unwrap();
        assert!(json.contains("\"priority\":\"medium\""));
        assert!(json.contains("\"timeslice_ms\":40"));
    }

    #[test]
    fn test_shutdown_clears_everything() {
        let mut vm = small_vm();
        vm.load_bytes(&exit_program(0), None).unwrap();
        vm.register_host_api("x", HostScope::Global, |_, _| Ok(()))
            .unwrap();
        vm.shutdown();
        assert!(vm.active_slots().is_empty());
        assert!(vm.host_apis().is_empty());
    }
}
