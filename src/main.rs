use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod cases;
mod driver;
mod expect;
mod fixtures;
mod harness;

use cases::TestCase;
use expect::CaseFailure;
use harness::Harness;

#[derive(Parser, Debug)]
#[command(author, version, about = "SQL shell conformance harness", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the conformance suite against a shell binary
    Run {
        /// Shell under test (path, or a name looked up on PATH)
        shell: PathBuf,
        /// Only run tests whose name contains this filter
        #[arg(short, long)]
        filter: Option<String>,
        /// Print per-test execution details
        #[arg(short, long, default_value_t = false)]
        verbose: bool,
        /// Run every selected case and report at the end instead of stopping at the first failure
        #[arg(short, long, default_value_t = false)]
        keep_going: bool,
        /// Kill the shell and fail the case if it runs longer than this
        #[arg(short, long)]
        timeout_secs: Option<u64>,
        /// Passed to `-init` so no user configuration is loaded
        #[arg(long, default_value = "/dev/null")]
        null_config: PathBuf,
    },
    /// List registered case names
    List {
        /// Only list tests whose name contains this filter
        #[arg(short, long)]
        filter: Option<String>,
    },
}

pub(crate) static VERBOSE: AtomicBool = AtomicBool::new(false);

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            shell,
            filter,
            verbose,
            keep_going,
            timeout_secs,
            null_config,
        } => {
            VERBOSE.store(verbose, Ordering::Relaxed);
            let harness = Harness::new(&shell, &null_config, timeout_secs.map(Duration::from_secs))?;
            run_tests(&harness, cases::all(), filter.as_deref(), keep_going)
        }
        Commands::List { filter } => {
            for (name, _) in select(cases::all(), filter.as_deref()) {
                println!("{name}");
            }
            Ok(())
        }
    }
}

fn select(cases: Vec<TestCase>, filter: Option<&str>) -> Vec<TestCase> {
    cases
        .into_iter()
        .filter(|(name, _)| filter.map_or(true, |f| name.contains(f)))
        .collect()
}

// --------------------- Test runner ----------------------------------------
fn run_tests(harness: &Harness, cases: Vec<TestCase>, filter: Option<&str>, keep_going: bool) -> Result<()> {
    let selected = select(cases, filter);
    let total = selected.len();
    if VERBOSE.load(Ordering::Relaxed) {
        println!("[INFO] shell {}", harness.shell().display());
    }

    let mut passed = 0usize;
    for (name, case) in selected {
        if VERBOSE.load(Ordering::Relaxed) {
            println!("[RUN ] {name}");
        }
        match case(harness) {
            Ok(()) => {
                passed += 1;
                println!("[PASS] {name}");
            }
            // Case failures may be collected; anything else means the environment is broken.
            Err(e) if keep_going && e.downcast_ref::<CaseFailure>().is_some() => {
                println!("[FAIL] {name}: {e:#}");
            }
            Err(e) => {
                println!("[FAIL] {name}");
                return Err(e.context(format!("case '{name}' failed")));
            }
        }
    }
    println!(
        "\n{passed}/{total} tests passed{}.",
        if filter.is_some() { " (filtered)" } else { "" }
    );
    if passed == total {
        return Ok(());
    }
    bail!("{} of {total} cases failed", total - passed);
}
