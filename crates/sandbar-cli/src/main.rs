mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_FAILURE, EXIT_PROVISION_ERROR, EXIT_TREE_ERROR};
use sandbar_core::{parse_config_file, ProvisionConfig};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "sandbar",
    version,
    about = "Runtime session coordinator for browser-hosted coding workspaces"
)]
struct Cli {
    /// Path to a Sandbar config TOML file (install/start commands, poll interval).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the runtime mount tree a project tree document transforms into.
    Transform {
        /// Path to a project tree JSON document.
        tree: PathBuf,
    },
    /// Provision a project tree in a scripted in-memory runtime.
    Preview {
        /// Path to a project tree JSON document.
        tree: PathBuf,
        /// Project identifier to bind the runtime to.
        #[arg(long, default_value = "preview")]
        project: String,
        /// Exit code for the scripted install step (non-zero fails the pipeline).
        #[arg(long, default_value_t = 0)]
        install_exit: i32,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("SANDBAR_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    let config = match &cli.config {
        Some(path) => match parse_config_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: config error: {e}");
                return ExitCode::from(EXIT_FAILURE);
            }
        },
        None => ProvisionConfig::default(),
    };
    let json_output = cli.json;

    let result = match cli.command {
        Commands::Transform { tree } => commands::transform::run(&tree),
        Commands::Preview {
            tree,
            project,
            install_exit,
        } => commands::preview::run(&tree, &project, &config, install_exit, json_output),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("tree error:") {
                EXIT_TREE_ERROR
            } else if msg.starts_with("provision error:") {
                EXIT_PROVISION_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
