//! CLI command definitions.

use cimple_runner::{JournalDriver, JournalFormat};
use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the project's build in the current directory
    Run {
        /// Only run these tasks (repeatable)
        #[arg(long = "task")]
        tasks: Vec<String>,

        /// Where journal records are shown: console or none
        #[arg(long, default_value = "console")]
        journal_driver: JournalDriver,

        /// Console journal format: text or json
        #[arg(long, default_value = "text")]
        journal_format: JournalFormat,

        /// Run context matched against a task's limit_to
        #[arg(long, default_value = "local")]
        run_context: String,

        /// Secret as type:key:password (repeatable)
        #[arg(long = "secret")]
        secrets: Vec<String>,

        /// Project file
        #[arg(long, default_value = "cimple.yaml")]
        configuration: PathBuf,
    },

    /// Start the build server
    Server {
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        /// Server configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Start a build agent
    Agent {
        #[arg(long)]
        server_addr: Option<String>,

        #[arg(long)]
        server_port: Option<u16>,

        /// Connect without TLS
        #[arg(long)]
        no_tls: bool,

        /// Agent configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// List agents connected to a server
    Agents {
        #[command(flatten)]
        server: ServerArgs,
    },

    /// List or submit builds
    Builds {
        #[command(flatten)]
        server: ServerArgs,

        #[command(subcommand)]
        command: Option<BuildCommands>,
    },

    /// Show a project's build graph
    Config {
        /// Project file
        #[arg(long, default_value = "cimple.yaml")]
        configuration: PathBuf,

        #[arg(long, value_enum, default_value_t = ConfigFormat::Text)]
        format: ConfigFormat,
    },
}

#[derive(Subcommand)]
pub enum BuildCommands {
    /// List builds waiting for an agent
    List,

    /// Queue a build of a repository at a commit
    Submit {
        url: String,
        commit: String,
    },
}

/// Server location for the API commands.
#[derive(Args)]
pub struct ServerArgs {
    #[arg(long)]
    pub server_addr: Option<String>,

    #[arg(long)]
    pub server_port: Option<u16>,

    /// CLI configuration file
    #[arg(long)]
    pub cli_config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConfigFormat {
    Text,
    Graphviz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}
