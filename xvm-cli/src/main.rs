//! XVM - XScript Virtual Machine
//! Command-line host for running and inspecting compiled XScript programs

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::*;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use xvm_core::{
    Budget, HostScope, Priority, ProgramImage, RunOutcome, ScriptStatus, SlotIndex, VM_CONFIG, VirtualMachine,
    VmResult,
};

#[derive(Parser)]
#[command(name = "xvm")]
#[command(author = "XScript Contributors")]
#[command(version)]
#[command(about = "XVM - XScript Virtual Machine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a program and run it until it stops
    Run {
        /// Compiled program (.xse)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Override the priority stored in the program (low, medium, high);
        /// `user` keeps the program's own priority and timeslice
        #[arg(short, long)]
        priority: Option<Priority>,

        /// Length of one run pass in milliseconds
        #[arg(long, default_value_t = 500)]
        slice_ms: u64,

        /// Give up after this many milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Call this function synchronously after starting and print its result
        #[arg(long, value_name = "NAME")]
        call: Option<String>,

        /// Enter this function and let it run under normal scheduling
        #[arg(long, value_name = "NAME")]
        invoke: Option<String>,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show header, tables and a disassembly of a program
    Inspect {
        /// Compiled program (.xse)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

struct RunOptions {
    priority: Option<Priority>,
    slice_ms: u64,
    timeout_ms: Option<u64>,
    call: Option<String>,
    invoke: Option<String>,
    json: bool,
}

#[derive(Serialize)]
struct RunReport {
    file: PathBuf,
    outcome: &'static str,
    elapsed_ms: u64,
    call_result: Option<String>,
    return_value: String,
    status: ScriptStatus,
}

#[derive(Serialize)]
struct InspectReport<'a> {
    file: &'a Path,
    image: &'a ProgramImage,
    disassembly: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "xvm=info,xvm_core=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            file,
            priority,
            slice_ms,
            timeout_ms,
            call,
            invoke,
            json,
        } => run_command(
            &file,
            RunOptions {
                priority,
                slice_ms,
                timeout_ms,
                call,
                invoke,
                json,
            },
        ),
        Commands::Inspect { file, json } => inspect_command(&file, json).map(|_| 0),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

// ============================================================================
// Console host APIs
// ============================================================================

fn flush_stdout() -> VmResult<()> {
    std::io::stdout()
        .flush()
        .map_err(|e| xvm_core::VmError::host("stdout", e.to_string()))
}

fn register_console_apis(vm: &mut VirtualMachine) -> VmResult<()> {
    vm.register_host_api("PrintString", HostScope::Global, |vm, slot| {
        let text = vm.param_as_string(slot, 0)?;
        print!("{}", text);
        flush_stdout()?;
        vm.return_from_host(slot, 1)
    })?;
    vm.register_host_api("PrintNewline", HostScope::Global, |vm, slot| {
        println!();
        vm.return_from_host(slot, 0)
    })?;
    vm.register_host_api("PrintTab", HostScope::Global, |vm, slot| {
        print!("\t");
        flush_stdout()?;
        vm.return_from_host(slot, 0)
    })?;
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

fn run_command(file: &Path, options: RunOptions) -> Result<i32> {
    if options.slice_ms == 0 {
        bail!("--slice-ms must be greater than zero");
    }

    let mut vm = VirtualMachine::with_config(VM_CONFIG.clone());
    register_console_apis(&mut vm).context("failed to register console host APIs")?;

    let slot = vm
        .load_file(file, options.priority)
        .with_context(|| format!("failed to load {}", file.display()))?;
    tracing::info!(file = %file.display(), slot, slice_ms = options.slice_ms, "running program");

    if !options.json {
        eprintln!(
            "{} {} into slot {}",
            "Loaded".green().bold(),
            file.display().to_string().cyan(),
            slot
        );
    }

    vm.start(slot)?;

    let call_result = match &options.call {
        Some(name) => {
            if let Err(e) = vm.call_function(slot, name) {
                tracing::warn!(function = %name, error = %e, "blocking call failed");
                return Err(e).with_context(|| format!("call to '{}' failed", name));
            }
            let result = vm.return_as_string(slot)?;
            tracing::info!(function = %name, result = %result, "blocking call returned");
            Some(result)
        }
        None => None,
    };

    if let Some(name) = &options.invoke {
        vm.invoke_function(slot, name)
            .with_context(|| format!("cannot invoke '{}'", name))?;
        tracing::info!(function = %name, "function invoked");
    }

    let started = Instant::now();
    let outcome = drive(&mut vm, options.slice_ms, options.timeout_ms, started)?;

    let report = RunReport {
        file: file.to_path_buf(),
        outcome,
        elapsed_ms: started.elapsed().as_millis() as u64,
        call_result,
        return_value: vm.return_as_string(slot)?,
        status: vm.status(slot)?,
    };
    let code = report.status.exit_code.unwrap_or(0);
    tracing::info!(
        outcome,
        elapsed_ms = report.elapsed_ms,
        executed = report.status.executed,
        exit_code = ?report.status.exit_code,
        "run finished"
    );

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_run_report(&report, slot);
    }

    vm.shutdown();
    Ok(code)
}

/// Run passes of `slice_ms` until nothing runs or the timeout expires
fn drive(vm: &mut VirtualMachine, slice_ms: u64, timeout_ms: Option<u64>, started: Instant) -> Result<&'static str> {
    loop {
        match vm.run(Budget::Millis(slice_ms)) {
            Ok(RunOutcome::Idle) => return Ok("finished"),
            Ok(RunOutcome::BudgetExhausted | RunOutcome::StackBaseReturned) => {}
            Err(e) => {
                tracing::warn!(error = %e, "run aborted");
                return Err(e).context("script faulted");
            }
        }
        if let Some(limit) = timeout_ms
            && started.elapsed().as_millis() >= u128::from(limit)
        {
            tracing::warn!(timeout_ms = limit, "timed out with scripts still running");
            return Ok("timed out");
        }
    }
}

fn print_run_report(report: &RunReport, slot: SlotIndex) {
    let status = &report.status;
    println!();
    println!("{}", "XVM run summary".bold());
    println!("  {:<14} {}", "slot:", slot);
    let outcome = if report.outcome == "finished" {
        report.outcome.green()
    } else {
        report.outcome.yellow()
    };
    println!("  {:<14} {}", "outcome:", outcome);
    println!("  {:<14} {} ms", "elapsed:", report.elapsed_ms);
    println!("  {:<14} {}", "executed:", status.executed);
    println!(
        "  {:<14} {} ({} ms slices)",
        "priority:", status.priority, status.timeslice_ms
    );
    match status.exit_code {
        Some(code) => println!("  {:<14} {}", "exit code:", code.to_string().cyan()),
        None => println!("  {:<14} {}", "exit code:", "none".dimmed()),
    }
    if let Some(result) = &report.call_result {
        println!("  {:<14} {}", "call result:", result.cyan());
    }
    println!("  {:<14} {}", "_RetVal:", report.return_value);
    println!(
        "  {:<14} top {} / frame {} / size {}",
        "stack:", status.stack_top, status.frame, status.stack_size
    );
}

fn inspect_command(file: &Path, json: bool) -> Result<()> {
    let image = ProgramImage::load(file).with_context(|| format!("failed to load {}", file.display()))?;
    tracing::info!(
        file = %file.display(),
        instructions = image.instructions.len(),
        functions = image.functions.len(),
        "inspecting program"
    );

    if json {
        let report = InspectReport {
            file,
            image: &image,
            disassembly: image.disassemble().lines().map(str::to_string).collect(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let header = &image.header;
    println!("{} {}", "Program".bold(), file.display().to_string().cyan());
    println!();
    println!("{}", "Header:".bold());
    println!("  {:<18} {}", "stack size:", header.stack_size);
    println!("  {:<18} {}", "global data:", header.global_data_size);
    println!("  {:<18} {}", "priority:", header.priority);
    if header.priority == Priority::User {
        println!("  {:<18} {} ms", "user timeslice:", header.user_timeslice_ms);
    }
    match image.main_function() {
        Some(main) => println!("  {:<18} {}", "main:", main.name.green()),
        None => println!("  {:<18} {}", "main:", "none".dimmed()),
    }
    println!();

    println!("{} ({})", "Functions:".bold(), image.functions.len());
    for (index, func) in image.functions.iter().enumerate() {
        println!(
            "  {:>4}  {:<20} entry {:<6} params {:<3} locals {}",
            index,
            func.name.cyan(),
            func.entry,
            func.param_count,
            func.local_data_size
        );
    }
    println!();

    println!("{} ({})", "Strings:".bold(), image.strings.len());
    for (index, text) in image.strings.iter().enumerate() {
        println!("  {:>4}  {:?}", index, text);
    }
    println!();

    println!("{} ({})", "Host APIs:".bold(), image.host_apis.len());
    for (index, name) in image.host_apis.iter().enumerate() {
        println!("  {:>4}  {}", index, name);
    }
    println!();

    println!("{} ({})", "Code:".bold(), image.instructions.len());
    print!("{}", image.disassemble());
    Ok(())
}
