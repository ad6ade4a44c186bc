//! Thin CLI wrapper over the osiris library: compile an OML document,
//! run a compiled manifest.

use clap::{Parser, Subcommand, ValueEnum};
use osiris::compile::{compile, emit, CompileError, CompileRequest};
use osiris::components::ComponentRegistry;
use osiris::connections::ConnectionCatalog;
use osiris::drivers::default_driver_registry;
use osiris::oml::OmlDocument;
use osiris::run::{run, AdapterKind, RunOptions};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

const EXIT_OML_INVALID: u8 = 2;
const EXIT_COMPILE_FAILURE: u8 = 3;
const EXIT_RUNTIME_FAILURE: u8 = 4;
const EXIT_CONFIG_FAILURE: u8 = 5;

#[derive(Parser)]
#[command(name = "osiris", about = "Deterministic compiler and runner for data movement pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile an OML document into a fingerprinted manifest.
    Compile {
        /// Path of the OML document.
        #[arg(long)]
        oml: PathBuf,
        /// Connection catalog YAML.
        #[arg(long)]
        connections: Option<PathBuf>,
        /// Active profile.
        #[arg(long, default_value = "dev")]
        profile: String,
        /// `key=value` parameters; values parse as JSON when possible.
        #[arg(long = "param")]
        params: Vec<String>,
        /// Output directory for the compiled artifact set.
        #[arg(long)]
        out: PathBuf,
    },
    /// Execute a compiled manifest.
    Run {
        /// Directory holding manifest.yaml and cfg/.
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long, value_enum, default_value_t = AdapterArg::Local)]
        adapter: AdapterArg,
        /// Root directory for session records.
        #[arg(long, default_value = "logs")]
        session_root: PathBuf,
        /// Worker program for the remote adapter.
        #[arg(long)]
        worker: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AdapterArg {
    Local,
    Remote,
}

impl From<AdapterArg> for AdapterKind {
    fn from(arg: AdapterArg) -> Self {
        match arg {
            AdapterArg::Local => AdapterKind::Local,
            AdapterArg::Remote => AdapterKind::Remote,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Compile {
            oml,
            connections,
            profile,
            params,
            out,
        } => compile_command(oml, connections, profile, params, out),
        Commands::Run {
            manifest,
            adapter,
            session_root,
            worker,
        } => run_command(manifest, adapter, session_root, worker),
    }
}

fn compile_command(
    oml_path: PathBuf,
    connections: Option<PathBuf>,
    profile: String,
    params: Vec<String>,
    out: PathBuf,
) -> ExitCode {
    let oml_yaml = match std::fs::read_to_string(&oml_path) {
        Ok(yaml) => yaml,
        Err(err) => {
            error!(path = %oml_path.display(), %err, "cannot read OML document");
            return ExitCode::from(EXIT_CONFIG_FAILURE);
        }
    };
    let oml = match OmlDocument::parse(&oml_yaml) {
        Ok(oml) => oml,
        Err(err) => {
            error!(%err, "OML document is not parseable");
            return ExitCode::from(EXIT_OML_INVALID);
        }
    };

    let registry = match ComponentRegistry::with_defaults() {
        Ok(registry) => registry,
        Err(err) => {
            error!(%err, "component registry failed to load");
            return ExitCode::from(EXIT_CONFIG_FAILURE);
        }
    };
    let catalog = match connections {
        None => ConnectionCatalog::default(),
        Some(path) => {
            let yaml = match std::fs::read_to_string(&path) {
                Ok(yaml) => yaml,
                Err(err) => {
                    error!(path = %path.display(), %err, "cannot read connection catalog");
                    return ExitCode::from(EXIT_CONFIG_FAILURE);
                }
            };
            match ConnectionCatalog::from_yaml_str(&yaml) {
                Ok(catalog) => catalog,
                Err(err) => {
                    error!(%err, "connection catalog invalid");
                    return ExitCode::from(EXIT_CONFIG_FAILURE);
                }
            }
        }
    };

    let params = parse_params(&params);
    let result = match compile(CompileRequest {
        oml: &oml,
        registry: &registry,
        catalog: &catalog,
        profile: &profile,
        params: &params,
    }) {
        Ok(result) => result,
        Err(CompileError::OmlInvalid(violations)) => {
            for violation in &violations {
                eprintln!("{violation}");
            }
            return ExitCode::from(EXIT_OML_INVALID);
        }
        Err(err @ (CompileError::Conn(_) | CompileError::Registry(_))) => {
            error!(code = err.code(), %err, "compilation failed");
            return ExitCode::from(EXIT_CONFIG_FAILURE);
        }
        Err(err) => {
            error!(code = err.code(), %err, "compilation failed");
            return ExitCode::from(EXIT_COMPILE_FAILURE);
        }
    };

    if let Err(err) = emit(&result, &out) {
        error!(%err, "artifact emission failed");
        return ExitCode::from(EXIT_COMPILE_FAILURE);
    }
    println!(
        "compiled {} (manifest_fp {})",
        result.manifest.pipeline.id,
        result.fingerprints().manifest_fp
    );
    ExitCode::SUCCESS
}

fn run_command(
    manifest_dir: PathBuf,
    adapter: AdapterArg,
    session_root: PathBuf,
    worker: Option<PathBuf>,
) -> ExitCode {
    let drivers = default_driver_registry();
    let specs = match ComponentRegistry::with_defaults() {
        Ok(specs) => specs,
        Err(err) => {
            error!(%err, "component registry failed to load");
            return ExitCode::from(EXIT_CONFIG_FAILURE);
        }
    };

    let result = run(
        &manifest_dir,
        adapter.into(),
        &session_root,
        &drivers,
        &specs,
        RunOptions {
            worker_program: worker,
            sandbox_timeout: None,
        },
    );
    match result {
        Ok(result) => {
            println!(
                "session {} finished (ok: {})",
                result.session_id, result.status.ok
            );
            if result.status.ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_RUNTIME_FAILURE)
            }
        }
        Err(err) => {
            error!(%err, "run setup failed");
            ExitCode::from(EXIT_CONFIG_FAILURE)
        }
    }
}

/// `key=value` parameters; values parse as JSON scalars when possible and
/// fall back to strings.
fn parse_params(raw: &[String]) -> serde_json::Value {
    let mut params = serde_json::Map::new();
    for entry in raw {
        let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
        let parsed = serde_json::from_str(value).unwrap_or_else(|_| json!(value));
        params.insert(key.to_string(), parsed);
    }
    serde_json::Value::Object(params)
}
