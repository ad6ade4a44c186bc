//! The sandbox-side worker program.
//!
//! Reads newline-JSON commands on stdin, prints replies, events and
//! metrics on stdout (the host mirrors them), and logs diagnostics to
//! stderr. The session inside the sandbox is sealed on every exit path.

use clap::Parser;
use osiris::components::ComponentRegistry;
use osiris::drivers::default_driver_registry;
use osiris::run::worker::WorkerRuntime;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "osiris-worker", about = "Sandbox-side step executor")]
struct Cli {
    /// Directory holding the uploaded manifest and cfg/ tree.
    #[arg(long, default_value = ".")]
    workdir: PathBuf,
}

fn main() -> ExitCode {
    // Stdout is the record channel; diagnostics must go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let specs = match ComponentRegistry::with_defaults() {
        Ok(specs) => specs,
        Err(err) => {
            error!(%err, "component registry failed to load");
            return ExitCode::from(4);
        }
    };

    let runtime = WorkerRuntime::new(cli.workdir, default_driver_registry(), specs);
    let exit = runtime.run(
        BufReader::new(std::io::stdin()),
        Box::new(std::io::stdout()),
    );
    ExitCode::from(exit.clamp(0, 255) as u8)
}
