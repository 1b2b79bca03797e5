use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use fieldsync_core::models::{EntityType, OperationKind};

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "Inspect and drive the offline sync queue from the command line")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// CLI profile name
    #[arg(long, global = true, value_name = "NAME")]
    pub profile: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show queue, conflict and last-sync status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Push queued operations and pull server changes now
    Sync {
        /// Output the cycle report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and manage queued operations
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Inspect and resolve sync conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Configure CLI profiles
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ResolutionChoice {
    /// Keep the device's version
    Local,
    /// Accept the server's version
    Server,
    /// Apply a field map combining both
    Merged,
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// List live operations in dispatch order
    List {
        /// Show dead operations instead
        #[arg(long)]
        dead: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Queue a mutation for an entity
    Add {
        /// Entity type (job, client, photo, material_usage)
        entity_type: EntityType,
        /// Entity ID
        entity_id: String,
        /// Mutation kind (create, update, delete)
        #[arg(long, default_value = "update")]
        kind: OperationKind,
        /// Changed fields as a JSON object
        #[arg(long, value_name = "JSON")]
        fields: Option<String>,
        /// Dispatch priority (higher first)
        #[arg(long, default_value_t = fieldsync_core::models::DEFAULT_PRIORITY)]
        priority: i32,
    },
    /// Requeue a dead operation with a fresh retry budget
    Retry {
        /// Operation ID
        id: String,
    },
    /// Drop an operation from the queue
    Discard {
        /// Operation ID
        id: String,
    },
}

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// List conflicts (unresolved by default)
    List {
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a conflict
    Resolve {
        /// Conflict ID
        id: String,
        /// Which side wins
        #[arg(long, value_enum)]
        strategy: ResolutionChoice,
        /// Merged field map as a JSON object (required for `merged`)
        #[arg(long, value_name = "JSON")]
        fields: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Initialize or update profile config
    Init {
        /// Remote authority base URL
        #[arg(long, value_name = "URL")]
        remote_url: Option<String>,
        /// Bearer token for the remote authority
        #[arg(long, value_name = "TOKEN")]
        auth_token: Option<String>,
        /// Local database path for this profile
        #[arg(long, value_name = "PATH")]
        database: Option<PathBuf>,
        /// Operations claimed per push batch
        #[arg(long, value_name = "N")]
        batch_size: Option<usize>,
        /// Disable automatic merging of disjoint edits
        #[arg(long)]
        no_auto_merge: bool,
        /// Keep current active profile instead of activating this one
        #[arg(long)]
        no_activate: bool,
    },
    /// Print the resolved profile
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}
