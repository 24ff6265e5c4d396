//! CLI argument parsing and command dispatch.
//!
//! Precedence for every setting: CLI flag > environment variable >
//! config file > built-in default. The `run` command executes the whole
//! pipeline and exits 0 on success, 1 on fatal failure or deadlock, and
//! 2 on a memory-forced shutdown.

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};

use codegraph_config::Config;
use codegraph_pipeline::PipelineSupervisor;
use codegraph_types::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "codegraph",
    version,
    about = "Analyze a repository into a knowledge graph of code relationships"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the full analysis pipeline to completion.
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Directory to analyze. Overrides TARGET_DIR and the config file.
    #[arg(long)]
    target: Option<Utf8PathBuf>,

    /// Config file path (TOML). Defaults to ./codegraph.toml when present.
    #[arg(long)]
    config: Option<Utf8PathBuf>,

    /// Data directory for the store, breaker state, and run reports.
    #[arg(long)]
    data_dir: Option<Utf8PathBuf>,

    /// Use the deterministic stub LLM and in-memory graph.
    #[arg(long)]
    test_mode: bool,

    /// Verbose structured logging.
    #[arg(long, short)]
    verbose: bool,
}

/// Parse arguments and dispatch. Handles all of its own output.
#[must_use]
pub fn run() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_pipeline(args),
    }
}

fn run_pipeline(args: RunArgs) -> ExitCode {
    let mut config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("codegraph: configuration error: {e}");
            return ExitCode::FATAL;
        }
    };
    if let Err(e) = config.apply_env_overrides() {
        eprintln!("codegraph: environment error: {e}");
        return ExitCode::FATAL;
    }
    if let Some(target) = args.target {
        config.pipeline.target_dir = target;
    }
    if let Some(data_dir) = args.data_dir {
        config.pipeline.data_dir = data_dir;
    }
    if args.test_mode {
        config.pipeline.test_mode = true;
    }
    if let Err(e) = config.validate() {
        eprintln!("codegraph: invalid configuration: {e}");
        return ExitCode::FATAL;
    }

    let _log_guard = crate::logging::init(args.verbose, config.pipeline.log_directory.as_deref());

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("codegraph: runtime init failed: {e}");
            return ExitCode::FATAL;
        }
    };

    runtime.block_on(async {
        let supervisor = PipelineSupervisor::new(config);
        tokio::select! {
            result = supervisor.run() => match result {
                Ok(report) => {
                    println!("{}", report.render());
                    report.exit_code()
                }
                Err(e) => {
                    eprintln!("codegraph: {e}");
                    ExitCode::FATAL
                }
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("codegraph: interrupted");
                ExitCode::FATAL
            }
        }
    })
}

fn load_config(path: Option<&camino::Utf8Path>) -> Result<Config, codegraph_config::ConfigError> {
    match path {
        Some(path) => Config::load(path),
        None => {
            let default = camino::Utf8Path::new("codegraph.toml");
            if default.exists() {
                Config::load(default)
            } else {
                Ok(Config::default())
            }
        }
    }
}
