#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use geovm::{
    CpuSnapshot, HaltReason, Image, Machine, MachineConfig, OutputStream, RunExit,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Steps executed between drains of buffered guest output.
const SLICE_STEPS: u64 = 100_000;

/// Process exit code when the cycle budget runs out before the guest halts.
const EXIT_BUDGET_EXHAUSTED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "geovm", about = "Run and inspect geovm program images")]
struct Cli {
    /// Log filter in `tracing_subscriber::EnvFilter` syntax.
    #[arg(long, global = true, env = "GEOVM_LOG", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load an image and run it until it halts or the cycle budget is spent.
    Run(RunArgs),
    /// Print the header of an image without running it.
    Inspect {
        image: PathBuf,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    image: PathBuf,

    /// JSON `MachineConfig`; flags below override its fields.
    #[arg(long, env = "GEOVM_CONFIG")]
    config: Option<PathBuf>,

    /// Stop after at most N steps.
    #[arg(long, env = "GEOVM_MAX_CYCLES")]
    max_cycles: Option<u64>,

    /// Route memory accesses through the MMU.
    #[arg(long, env = "GEOVM_MMU")]
    mmu: bool,

    /// Print every executed instruction to stderr.
    #[arg(long)]
    trace: bool,

    /// Bytes queued on the console input register before the run starts.
    #[arg(long)]
    input: Option<String>,

    /// Restore CPU state from a JSON snapshot after loading the image.
    #[arg(long)]
    load_state: Option<PathBuf>,

    /// Write the final CPU state as a JSON snapshot.
    #[arg(long)]
    save_state: Option<PathBuf>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Command::Run(args) => run(args),
        Command::Inspect { image } => {
            inspect(&image)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_logging(filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_new(filter).with_context(|| format!("invalid log filter: {filter}"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read image: {}", path.display()))
}

fn load_config(args: &RunArgs) -> Result<MachineConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let f = File::open(path)
                .with_context(|| format!("failed to open config: {}", path.display()))?;
            serde_json::from_reader(BufReader::new(f))
                .with_context(|| format!("failed to parse config: {}", path.display()))?
        }
        None => MachineConfig::default(),
    };
    if args.mmu {
        config.enable_mmu = true;
    }
    if let Some(max_cycles) = args.max_cycles {
        config.max_cycles = max_cycles;
    }
    Ok(config)
}

#[derive(Default)]
struct GuestOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl GuestOutput {
    fn drain(&mut self) -> Result<()> {
        if !self.stdout.is_empty() {
            let mut out = io::stdout().lock();
            out.write_all(&self.stdout)?;
            out.flush()?;
            self.stdout.clear();
        }
        if !self.stderr.is_empty() {
            io::stderr().write_all(&self.stderr)?;
            self.stderr.clear();
        }
        Ok(())
    }
}

fn run(args: RunArgs) -> Result<ExitCode> {
    let config = load_config(&args)?;
    let bytes = read_image(&args.image)?;
    let mut machine = Machine::new(&config).context("failed to build machine")?;
    let loaded = machine
        .load(&bytes)
        .with_context(|| format!("failed to load image: {}", args.image.display()))?;
    info!(
        isa = %loaded.header.isa,
        instructions = loaded.header.instruction_count,
        entry_pc = loaded.entry_pc,
        mmu = machine.is_paged(),
        "image loaded"
    );

    if let Some(path) = &args.load_state {
        let f = File::open(path)
            .with_context(|| format!("failed to open snapshot: {}", path.display()))?;
        let snapshot: CpuSnapshot = serde_json::from_reader(BufReader::new(f))
            .with_context(|| format!("failed to parse snapshot: {}", path.display()))?;
        machine.load_state(&snapshot);
    }

    let output = Rc::new(RefCell::new(GuestOutput::default()));
    let console = output.clone();
    machine.set_console_output(move |byte| console.borrow_mut().stdout.push(byte));
    let syscall = output.clone();
    machine.set_syscall_output(move |stream, bytes| {
        let mut out = syscall.borrow_mut();
        match stream {
            OutputStream::Stdout => out.stdout.extend_from_slice(bytes),
            OutputStream::Stderr => out.stderr.extend_from_slice(bytes),
        }
    });
    if let Some(input) = &args.input {
        machine.memory_mut().push_console_input(input.as_bytes());
    }
    if args.trace {
        machine.set_instruction_hook(|t| {
            eprintln!(
                "{:#010x}: {:08x} op={:#04x} {:?}",
                t.pc, t.word, t.opcode, t.operands
            );
        });
    }

    let exit = run_sliced(&mut machine, config.max_cycles, || output.borrow_mut().drain())?;
    output.borrow_mut().drain()?;

    let diagnostics = machine.take_diagnostics();
    info!(
        cycles = machine.cycles(),
        instructions = machine.instructions_executed(),
        diagnostics = diagnostics.len(),
        exit = ?exit,
        "run finished"
    );

    if let Some(path) = &args.save_state {
        let f = File::create(path)
            .with_context(|| format!("failed to create snapshot: {}", path.display()))?;
        let mut w = BufWriter::new(f);
        serde_json::to_writer_pretty(&mut w, &machine.get_state())
            .with_context(|| format!("failed to write snapshot: {}", path.display()))?;
        w.flush()?;
    }

    match exit {
        RunExit::Halted(HaltReason::Exit { code }) => Ok(ExitCode::from(code as u8)),
        RunExit::Halted(HaltReason::Error(err)) => {
            bail!("guest stopped at pc {:#010x}: {err}", machine.pc())
        }
        RunExit::Halted(_) => Ok(ExitCode::SUCCESS),
        RunExit::BudgetExhausted | RunExit::Interrupted { .. } => {
            warn!(max_cycles = config.max_cycles, "cycle budget exhausted");
            Ok(ExitCode::from(EXIT_BUDGET_EXHAUSTED))
        }
    }
}

/// Runs `machine` for at most `budget` cycles in slices of [`SLICE_STEPS`], calling
/// `after_slice` between slices. A slice cut short by an interrupt is charged only the cycles it
/// retired.
fn run_sliced(
    machine: &mut Machine,
    budget: u64,
    mut after_slice: impl FnMut() -> Result<()>,
) -> Result<RunExit> {
    let mut remaining = budget;
    loop {
        if remaining == 0 {
            return Ok(RunExit::BudgetExhausted);
        }
        let slice = remaining.min(SLICE_STEPS);
        let before = machine.cycles();
        let exit = machine.run(slice);
        after_slice()?;
        match exit {
            RunExit::BudgetExhausted => remaining -= slice,
            RunExit::Interrupted { .. } => {
                remaining -= machine.cycles().saturating_sub(before).min(remaining);
            }
            RunExit::Halted(_) => return Ok(exit),
        }
    }
}

fn inspect(path: &Path) -> Result<()> {
    let bytes = read_image(path)?;
    let image = Image::parse(&bytes)
        .with_context(|| format!("invalid image: {}", path.display()))?;
    let header = image.header();
    println!("isa:          {} (version {})", header.isa, header.isa.version());
    println!("timestamp:    {}", header.timestamp);
    println!("instructions: {}", header.instruction_count);
    println!("entry point:  {:#x}", header.entry_point);
    println!("checksum:     {:#010x}", header.checksum);
    Ok(())
}
