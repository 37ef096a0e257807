use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tandem_core::EntityType;

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Inspect and drive Tandem sync from the command line")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// CLI profile holding account and remote settings
    #[arg(long, global = true, value_name = "NAME")]
    pub profile: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create or update an entity
    Put {
        /// Entity type (booking, favorite, settings)
        #[arg(value_parser = parse_entity_type)]
        entity_type: EntityType,
        /// Entity ID
        id: String,
        /// JSON object payload (read from stdin when omitted)
        payload: Option<String>,
    },
    /// Delete an entity
    Delete {
        #[arg(value_parser = parse_entity_type)]
        entity_type: EntityType,
        id: String,
    },
    /// Show one entity as the UI sees it
    Get {
        #[arg(value_parser = parse_entity_type)]
        entity_type: EntityType,
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List cached entities
    List {
        /// Only list this entity type
        #[arg(value_parser = parse_entity_type)]
        entity_type: Option<EntityType>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show unconfirmed local changes
    Queue {
        #[command(subcommand)]
        command: Option<QueueCommands>,
        /// Include failed changes
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Sync with the remote store
    Sync {
        #[command(subcommand)]
        command: Option<SyncCommands>,
    },
    /// Manage devices registered to the account
    Device {
        #[command(subcommand)]
        command: DeviceCommands,
    },
    /// Create, move and restore backups
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
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
    #[value(name = "powershell")]
    PowerShell,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ResolveStrategy {
    KeepLocal,
    KeepRemote,
    Merged,
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Queue a failed change again
    Retry {
        /// Operation ID
        op_id: String,
    },
    /// Drop a failed change, rolling back its local effect
    Dismiss {
        /// Operation ID
        op_id: String,
    },
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Run one sync cycle now
    Run,
    /// Show current sync status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List conflicts awaiting a decision
    Conflicts {
        /// Include resolved conflicts
        #[arg(long)]
        history: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a conflict
    Resolve {
        /// Conflict ID
        conflict_id: String,
        #[arg(long, value_enum)]
        strategy: ResolveStrategy,
        /// JSON payload for `merged` (`null` deletes the entity)
        #[arg(long, value_name = "JSON")]
        payload: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum DeviceCommands {
    /// Register this installation with the account
    Register,
    /// List known devices
    List {
        /// Fetch the device list from the remote store first
        #[arg(long)]
        refresh: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Mark a device as the account's primary device
    Primary { device_id: String },
    /// Mark a device inactive
    Deactivate { device_id: String },
}

#[derive(Subcommand)]
pub enum BackupCommands {
    /// Snapshot confirmed entities
    Create,
    /// List stored backups
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write a backup to a JSON file
    Export {
        backup_id: String,
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Read a backup file exported on another device
    Import {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Replace local state with a backup (discards unsynced changes)
    Restore { backup_id: String },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Initialize or update profile config
    Init {
        /// Account the profile syncs
        #[arg(long, value_name = "ID")]
        account_id: Option<String>,
        /// Remote store base URL
        #[arg(long, value_name = "URL")]
        remote_url: Option<String>,
        /// Bearer token for the remote store
        #[arg(long, value_name = "TOKEN")]
        auth_token: Option<String>,
        /// Keep current active profile instead of activating this one
        #[arg(long)]
        no_activate: bool,
    },
}

fn parse_entity_type(value: &str) -> Result<EntityType, String> {
    value.parse()
}
