//! tibok-ext - Command-line administration of tibok plugins
//!
//! Lists, installs, updates and toggles plugins from the tibok catalog, and
//! produces the keys and signatures packagers publish alongside packages.

mod commands;
mod config;

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{catalog, keys, list, manage, state};
use config::ConfigOverrides;

/// tibok-ext - Manage tibok editor plugins
#[derive(Parser, Debug)]
#[command(
    name = "tibok-ext",
    author,
    version,
    about = "Manage tibok editor plugins",
    long_about = "tibok-ext installs, updates and manages plugins for the tibok editor.\nEvery install asks for consent before a plugin receives the capabilities it requests."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// Configuration file (defaults to ~/.tibok/plugins.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Plugins directory (overrides TIBOK_PLUGINS_DIR)
    #[arg(long, global = true)]
    plugins_dir: Option<PathBuf>,

    /// Catalog URL (overrides TIBOK_REGISTRY_URL)
    #[arg(long, global = true)]
    registry_url: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List installed plugins
    ///
    /// Shows every discovered plugin with its trust tier and state, followed
    /// by plugins that failed to load and identifier conflicts.
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Search the plugin catalog
    Search {
        /// Text matched against names, descriptions and keywords
        #[arg(default_value = "")]
        query: String,

        /// Only plugins in this category
        #[arg(long)]
        category: Option<String>,

        /// Only plugins of this trust tier (official, verified, community)
        #[arg(long)]
        tier: Option<String>,

        /// Fetch the catalog even if a cached copy exists
        #[arg(long)]
        refresh: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a catalog entry and the access it requests
    Info {
        /// Plugin identifier
        id: String,
    },

    /// Install a plugin from the catalog
    ///
    /// # Examples
    ///
    ///   $ tibok-ext install com.example.wordcount
    ///   $ tibok-ext install com.example.pdf --yes
    Install {
        /// Plugin identifier
        id: String,

        /// Approve requested capabilities without prompting
        #[arg(short, long)]
        yes: bool,
    },

    /// Update an installed plugin to the catalog version
    Update {
        /// Plugin identifier
        id: String,

        /// Approve requested capabilities without prompting
        #[arg(short, long)]
        yes: bool,
    },

    /// List installed plugins with a newer catalog version
    Outdated,

    /// Remove an installed plugin
    Uninstall {
        /// Plugin identifier
        id: String,
    },

    /// Enable a plugin
    Enable {
        /// Plugin identifier
        id: String,

        /// Approve requested capabilities without prompting
        #[arg(short, long)]
        yes: bool,
    },

    /// Disable a plugin
    Disable {
        /// Plugin identifier
        id: String,
    },

    /// Generate an Ed25519 signing keypair
    Keygen {
        /// Directory to write the keys into
        #[arg(long)]
        out: PathBuf,

        /// Base name of the key files
        #[arg(long, default_value = "publisher")]
        name: String,
    },

    /// Print the checksum and signature of a package
    Sign {
        /// Package file (.tar.gz)
        file: PathBuf,

        /// Private key file written by `keygen`
        #[arg(long)]
        key: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // If no command provided, show help
    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    let overrides = ConfigOverrides {
        config_file: args.config,
        plugins_dir: args.plugins_dir,
        registry_url: args.registry_url,
    };

    match command {
        Command::List { json } => list::execute(&overrides, json).await,
        Command::Search { query, category, tier, refresh, json } => {
            catalog::search(&overrides, &query, category, tier.as_deref(), refresh, json).await
        }
        Command::Info { id } => catalog::info(&overrides, &id).await,
        Command::Install { id, yes } => manage::install(&overrides, &id, yes).await,
        Command::Update { id, yes } => manage::update(&overrides, &id, yes).await,
        Command::Outdated => manage::outdated(&overrides).await,
        Command::Uninstall { id } => manage::uninstall(&overrides, &id).await,
        Command::Enable { id, yes } => state::enable(&overrides, &id, yes).await,
        Command::Disable { id } => state::disable(&overrides, &id).await,
        Command::Keygen { out, name } => keys::keygen(&out, &name),
        Command::Sign { file, key } => keys::sign(&file, &key),
    }
}
