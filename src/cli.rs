use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

use crate::config::ClientConfig;

#[derive(Parser, Debug)]
#[command(name = "justjio-client")]
#[command(version)]
#[command(about = "Realtime chat client for JustJio rooms")]
pub struct Args {
    /// Path to a TOML config file
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Streaming endpoint (overrides config and JUSTJIO_WS_URL)
    #[arg(long, global = true)]
    pub ws_url: Option<String>,

    /// REST API base URL (overrides config and JUSTJIO_API_URL)
    #[arg(long, global = true)]
    pub api_url: Option<String>,

    /// Print messages as JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Show a room's recent history, then follow new messages
    Tail {
        room: String,
        /// History pages to load before following
        #[arg(long, default_value = "1")]
        pages: u32,
    },
    /// Follow new messages from every room you belong to
    Listen,
    /// Print one page of a room's history (page 1 is the newest)
    History {
        room: String,
        #[arg(long, default_value = "1")]
        page: u32,
    },
    /// Post a message to a room
    Send {
        room: String,
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Show the user the configured token belongs to
    Whoami,
    /// Generate shell completions
    Completions { shell: Shell },
}

impl Args {
    /// Layer command-line overrides on top of a loaded config.
    pub fn apply_overrides(&self, mut config: ClientConfig) -> ClientConfig {
        if let Some(url) = &self.ws_url {
            config.ws_url = url.clone();
        }
        if let Some(url) = &self.api_url {
            config.api_url = url.clone();
        }
        config
    }
}
