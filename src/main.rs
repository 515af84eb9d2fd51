use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use tracing::info;

use emu4::console::run_console;
use emu4::logging::{log_level, logging_setup};
use emu4::system_config::CpuConfig;
use emu4::systems::cpu_context::CpuContext;
use emu4::systems::runner::{lock, Runner};

/// 4-bit stored-program computer simulator with an interactive shell
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Program source to load before the prompt opens
    program: Option<PathBuf>,

    /// JSON machine description
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Clock period in milliseconds; 0 runs programs synchronously
    #[arg(long)]
    clock: Option<u64>,

    /// State file used by autoload and autosave
    #[arg(long)]
    state: Option<PathBuf>,

    /// Open the full-screen monitor instead of the line shell
    #[arg(long)]
    monitor: bool,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Feed this file into the terminal key buffer
    #[arg(long)]
    input: Option<PathBuf>,

    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_file = args
        .log_file
        .as_ref()
        .map(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("could not open log file `{}`", path.display()))
        })
        .transpose()?;
    logging_setup(log_level(args.verbose.log_level()), log_file);

    let mut config = match &args.config {
        Some(path) => CpuConfig::from_json_file(path)
            .with_context(|| format!("could not load config `{}`", path.display()))?,
        None => CpuConfig::default(),
    };
    if let Some(ms) = args.clock {
        config.clock.interval_ms = ms;
    }
    if let Some(state) = &args.state {
        config.state.file = state.clone();
    }
    let interval = config.clock.interval();
    let console_config = config.console.clone();

    let mut cpu = CpuContext::new(config).context("invalid machine configuration")?;
    let state = cpu.config().state.clone();
    if state.autoload && state.file.exists() {
        cpu.load_state(&state.file)
            .with_context(|| format!("could not restore `{}`", state.file.display()))?;
    }
    if let Some(path) = &args.program {
        let count = cpu
            .load_program_file(path)
            .with_context(|| format!("could not load program `{}`", path.display()))?;
        info!(count, "program ready");
    }
    if let Some(path) = &args.input {
        let file = File::open(path).with_context(|| format!("could not open input `{}`", path.display()))?;
        cpu.datapath()
            .bus()
            .terminal()
            .spawn_capture(file)
            .context("could not start terminal input")?;
    }

    let context = Arc::new(Mutex::new(cpu));
    let runner = match interval {
        Some(interval) => Some(Runner::start(Arc::clone(&context), interval)?),
        None => None,
    };

    if args.monitor {
        run_console(Arc::clone(&context), console_config).context("monitor failed")?;
    } else {
        repl(&context)?;
    }

    if let Some(runner) = runner {
        runner.shutdown();
    }
    let cpu = lock(&context);
    if cpu.autosave()? {
        println!("state saved to {}", cpu.config().state.file.display());
    }
    Ok(())
}

fn repl(context: &Mutex<CpuContext>) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    println!("emu4 shell, `help` lists commands, `exit` quits");

    loop {
        let prompt = lock(context).prompt();
        print!("{prompt}");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            println!();
            break;
        }
        let line = line.trim();
        if matches!(line, "exit" | "quit") {
            break;
        }

        let result = lock(context).execute_line(line);
        match result {
            Ok(Some(output)) => println!("{output}"),
            Ok(None) => {}
            Err(e) => println!("error: {e}"),
        }
    }
    Ok(())
}
