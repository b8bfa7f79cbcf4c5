//! CLI entry and dispatch.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokfork_core::{config, logging};

mod commands;

use commands::explore::BranchSpec;

#[derive(Parser)]
#[command(name = "tokfork")]
#[command(version = "0.1")]
#[command(about = "Step through token generation and fork branches from any token")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log to stderr instead of the log file
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Generate from a prompt and print the branch tree
    Explore {
        /// Prompt to generate from
        #[arg(short, long)]
        prompt: String,

        /// Model file (defaults to the last loaded model)
        #[arg(short, long, value_name = "PATH", env = "TOKFORK_MODEL")]
        model: Option<PathBuf>,

        /// Maximum tokens per branch (0 = unbounded)
        #[arg(long, value_name = "N")]
        max_samples: Option<usize>,

        /// Override the sampling temperature
        #[arg(long, value_name = "T")]
        temperature: Option<f32>,

        /// Override top-k
        #[arg(long, value_name = "K")]
        top_k: Option<i32>,

        /// Fork from the node at ROW:LANE using candidate INDEX (repeatable)
        #[arg(long = "branch", value_name = "ROW:LANE:INDEX")]
        branches: Vec<BranchSpec>,

        /// Print the tree and its layout as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Manage persisted sample settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
}

#[derive(clap::Subcommand)]
enum SettingsCommands {
    /// Show the path to the settings file
    Path,
    /// Print the effective sample settings
    Show,
    /// Write default sample settings (if not present)
    Init,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load().context("load config")?;

    match cli.command {
        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
        },

        Commands::Settings { command } => match command {
            SettingsCommands::Path => {
                commands::settings::path(&config);
                Ok(())
            }
            SettingsCommands::Show => commands::settings::show(&config),
            SettingsCommands::Init => commands::settings::init(&config),
        },

        Commands::Explore {
            prompt,
            model,
            max_samples,
            temperature,
            top_k,
            branches,
            json,
        } => {
            let _log_guard = logging::init(&config.log, cli.verbose).context("init logging")?;

            // one tokio runtime for everything
            let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;
            rt.block_on(commands::explore::run(commands::explore::ExploreOptions {
                prompt: &prompt,
                model: model.as_deref(),
                max_samples,
                temperature,
                top_k,
                branches: &branches,
                json,
                config: &config,
            }))
        }
    }
}
