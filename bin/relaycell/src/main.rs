mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "relaycell")]
#[command(about = "Multi-agent delegation runtime", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Config file (defaults to ~/.relaycell/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request to an agent and wait for the answer
    Ask {
        /// Agent that receives the request
        #[arg(short, long)]
        agent: String,

        /// Conversation context
        #[arg(long, default_value = "default")]
        context: String,

        /// Name recorded as the requester
        #[arg(long, default_value = "user")]
        from: String,

        /// Seconds to wait for an answer
        #[arg(long, default_value_t = 300)]
        timeout: u64,

        /// Image files to attach
        #[arg(long = "image")]
        images: Vec<PathBuf>,

        message: String,
    },

    /// List known agents
    Agents,

    /// List unfinished tasks
    Tasks,

    /// Show the conversation between two agents
    History {
        a: String,
        b: String,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Delete the conversation between two agents
    ClearHistory { a: String, b: String },

    /// Rename an agent everywhere it is referenced
    RenameAgent { old: String, new: String },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }

    let env = commands::Env::load(cli.config)?;

    match cli.command {
        Commands::Ask {
            agent,
            context,
            from,
            timeout,
            images,
            message,
        } => {
            commands::ask::run(&env, &agent, &context, &from, timeout, &images, &message).await?;
        }
        Commands::Agents => commands::agents::list(&env)?,
        Commands::Tasks => commands::tasks_cmd::list(&env)?,
        Commands::History { a, b, limit } => commands::agents::history(&env, &a, &b, limit)?,
        Commands::ClearHistory { a, b } => commands::agents::clear_history(&env, &a, &b)?,
        Commands::RenameAgent { old, new } => commands::agents::rename(&env, &old, &new)?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => commands::config_cmd::show(&env)?,
            ConfigCommands::Init { force } => commands::config_cmd::init(&env, force)?,
        },
    }

    Ok(())
}
