//! FlowGuard CLI
//!
//! A command-line tool for training and trying out flow classifiers, and
//! for inspecting offenders and bans on a running agent.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{agent, model};
use std::path::PathBuf;

/// FlowGuard CLI
#[derive(Parser)]
#[command(name = "fgctl")]
#[command(author, version, about = "CLI for the FlowGuard network flow guard", long_about = None)]
pub struct Cli {
    /// Agent API URL (can also be set via FGCTL_API_URL env var)
    #[arg(long, env = "FGCTL_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short, value_enum)]
    pub format: Option<output::OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train a classifier from a labelled flow CSV and save it
    Train {
        /// Labelled flow CSV
        #[arg(long, short)]
        input: PathBuf,

        /// Directory models are stored in
        #[arg(long)]
        model_dir: Option<PathBuf>,

        /// Model file name
        #[arg(long, default_value = "latest.json")]
        name: String,

        /// Gradient descent epochs
        #[arg(long, default_value_t = 500)]
        epochs: usize,

        /// Seed for the train/validation split
        #[arg(long, default_value_t = 1)]
        seed: u64,
    },

    /// Classify a flow CSV offline with a saved model
    Score {
        /// Flow CSV to classify
        #[arg(long, short)]
        input: PathBuf,

        /// Directory models are stored in
        #[arg(long)]
        model_dir: Option<PathBuf>,

        /// Model file name
        #[arg(long, default_value = "latest.json")]
        name: String,

        /// List benign flows too
        #[arg(long)]
        all: bool,
    },

    /// List offenders tracked by the agent
    Offenders {
        /// Show only banned offenders
        #[arg(long)]
        banned: bool,
    },

    /// List active bans
    Bans,

    /// Show agent status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = config::Config::load()?;
    let format = settings.format(cli.format)?;

    match cli.command {
        Commands::Train {
            input,
            model_dir,
            name,
            epochs,
            seed,
        } => {
            model::train_model(&input, &settings.model_dir(model_dir), &name, epochs, seed, format)?;
        }
        Commands::Score {
            input,
            model_dir,
            name,
            all,
        } => {
            model::score_flows(&input, &settings.model_dir(model_dir), &name, all, format)?;
        }
        Commands::Offenders { banned } => {
            let client = client::ApiClient::new(&settings.api_url(cli.api_url))?;
            agent::show_offenders(&client, banned, format).await?;
        }
        Commands::Bans => {
            let client = client::ApiClient::new(&settings.api_url(cli.api_url))?;
            agent::show_bans(&client, format).await?;
        }
        Commands::Status => {
            let client = client::ApiClient::new(&settings.api_url(cli.api_url))?;
            agent::show_status(&client, format).await?;
        }
    }

    Ok(())
}
