//! `ringtail`: prints trace files, following the writers by default.

use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use ringtrace::{CatControl, LevelMask, OutputOptions, ReadError, TailControl};

#[derive(Parser, Debug)]
#[command(name = "ringtail", version, about = "Print trace files, following writers as they append")]
struct Args {
    /// Print existing messages and exit
    #[arg(short, long)]
    cat: bool,

    /// Print file and line of each trace statement
    #[arg(short, long)]
    files: bool,

    /// Levels to print, e.g. `0,2-4`
    #[arg(short, long, value_name = "LEVELS")]
    levels: Option<LevelMask>,

    /// Print timestamp counter values
    #[arg(short, long)]
    tsc: bool,

    /// Print only messages carrying a wall-clock timestamp
    #[arg(short, long, alias = "wallClock")]
    wall_clock: bool,

    /// Print trace file events on stderr
    #[arg(short = 'x', long)]
    events: bool,

    /// Print the timestamp messages were merged by
    #[arg(short, long)]
    debug: bool,

    /// Also write the reader's own diagnostics to a daily log in this directory
    #[arg(long, value_name = "DIR")]
    diag_dir: Option<PathBuf>,

    #[arg(value_name = "FILE", required = true)]
    paths: Vec<PathBuf>,
}

fn init_logging(diag_dir: Option<&Path>) -> Option<WorkerGuard> {
    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()));
    let (file, guard) = match diag_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ringtail.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "debug".into()));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry().with(stderr).with(file).init();
    guard
}

fn run(args: &Args, options: OutputOptions) -> Result<bool, ReadError> {
    let out = BufWriter::new(io::stdout());
    if args.cat {
        CatControl::new(&args.paths, options, out)?.run()
    } else {
        let mut control = TailControl::new(&args.paths, options, out)?.poll_stdout(true);
        control.run()?;
        Ok(!control.had_failures())
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _guard = init_logging(args.diag_dir.as_deref());

    let options = OutputOptions {
        levels: args.levels.unwrap_or_default(),
        file_line: args.files,
        tsc: args.tsc,
        wall_clock: args.wall_clock,
        events: args.events,
        file_name: false,
        debug: args.debug,
    };
    match run(&args, options) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(ReadError::OutputClosed) => ExitCode::FAILURE,
        Err(ReadError::Output(_)) => {
            eprintln!("---------- error writing to stdout, aborting");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("ringtail: {}", e);
            ExitCode::FAILURE
        }
    }
}
