//! daremex - terminal client for DareMeX direct messages

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use daremex_chat::auth;
use daremex_chat::models::MessageKind;

#[derive(Parser)]
#[command(name = "daremex")]
#[command(about = "Terminal client for DareMeX direct messages", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with email and password
    Login {
        #[arg(short, long)]
        email: String,

        #[arg(short, long)]
        password: String,

        /// Sign in again even if a valid session exists
        #[arg(short, long)]
        force: bool,
    },

    /// Log out and clear cached credentials
    Logout,

    /// Show current authentication status
    Status,

    /// Store the backend project URL and anon key
    Configure {
        #[arg(long)]
        url: String,

        #[arg(long)]
        anon_key: String,
    },

    /// List conversations, most recent first
    Inbox,

    /// Read the history of a conversation
    Read {
        /// Counterpart user id
        counterpart: String,

        /// Number of history pages to load
        #[arg(short, long, default_value = "1")]
        pages: usize,
    },

    /// Send a message
    Send {
        /// Counterpart user id
        #[arg(short, long)]
        to: String,

        /// Payload kind: text, image, video, file
        #[arg(short, long, default_value = "text")]
        kind: MessageKind,

        /// Message text, or a local file path for non-text kinds
        content: String,
    },

    /// Mark a conversation as read
    MarkRead {
        /// Counterpart user id
        counterpart: String,
    },

    /// Follow incoming messages until Ctrl-C
    Listen {
        /// Keep this conversation open while listening
        #[arg(short, long)]
        with: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Login {
            email,
            password,
            force,
        } => {
            tracing::info!("Signing in...");
            auth::login(&email, &password, force).await?;
        }
        Commands::Logout => {
            tracing::info!("Logging out...");
            auth::logout().await?;
        }
        Commands::Status => {
            auth::status().await?;
        }
        Commands::Configure { url, anon_key } => {
            commands::configure(&url, &anon_key)?;
        }
        Commands::Inbox => {
            tracing::info!("Fetching conversations...");
            commands::inbox().await?;
        }
        Commands::Read { counterpart, pages } => {
            commands::read(&counterpart, pages).await?;
        }
        Commands::Send { to, kind, content } => {
            tracing::info!("Sending message...");
            commands::send(&to, kind, &content).await?;
        }
        Commands::MarkRead { counterpart } => {
            commands::mark_read(&counterpart).await?;
        }
        Commands::Listen { with } => {
            commands::listen(with.as_deref()).await?;
        }
    }

    Ok(())
}
