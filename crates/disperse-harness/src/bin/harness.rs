//! CLI entry point: build a volume geometry, run the scenarios, emit a
//! JSONL report and exit non-zero on any failure.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use disperse_harness::report::Emitter;
use disperse_harness::scenarios::{self, Setup};

#[derive(Parser, Debug)]
#[command(name = "disperse-harness", about = "Dispersed-volume scenario harness")]
struct Args {
    /// Total brick count (N).
    #[arg(long, default_value_t = 6)]
    nodes: u8,

    /// Redundancy brick count (M); data bricks are N - M.
    #[arg(long, default_value_t = 2)]
    redundancy: u8,

    /// Write the JSONL report here instead of stdout.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Run only the named scenario.
    #[arg(long)]
    scenario: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.redundancy == 0 || u16::from(args.redundancy) * 2 >= u16::from(args.nodes) {
        eprintln!(
            "invalid geometry: nodes={} redundancy={} (need 2M < N)",
            args.nodes, args.redundancy
        );
        return ExitCode::from(2);
    }

    let mut emitter = match &args.report {
        Some(path) => match Emitter::file(path) {
            Ok(e) => e,
            Err(err) => {
                eprintln!("cannot open report file: {err}");
                return ExitCode::from(2);
            }
        },
        None => Emitter::stdout(),
    };

    let setup = Setup {
        nodes: args.nodes,
        redundancy: args.redundancy,
    };

    match args.scenario.as_deref() {
        None => scenarios::run_all(&setup, &mut emitter),
        Some("striping") => scenarios::striping(&setup, &mut emitter),
        Some("partial-update") => scenarios::partial_update(&setup, &mut emitter),
        Some("eager-lock") => scenarios::eager_lock(&setup, &mut emitter),
        Some("heal") => scenarios::heal(&setup, &mut emitter),
        Some("name-heal") => scenarios::name_heal(&setup, &mut emitter),
        Some(other) => {
            eprintln!("unknown scenario '{other}'");
            return ExitCode::from(2);
        }
    }

    eprintln!("{} passed, {} failed", emitter.passed, emitter.failed);
    if emitter.failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
