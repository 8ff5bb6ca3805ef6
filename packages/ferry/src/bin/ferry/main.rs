//! The binary entrypoint for `ferry`, a thin debug harness over the
//! cache/transport library — not the build tool's own CLI surface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::Context as _;
use tracing::instrument;
use tracing_subscriber::util::SubscriberInitExt;

use ferry::cache::Flags;

mod log;

#[derive(Debug, Parser)]
#[command(name = "ferry", about = "Debug harness for the server-aware cache/transport library")]
struct TopLevelFlags {
    #[command(subcommand)]
    command: Command,

    /// Path to the ferry config file.
    #[arg(long, env = "FERRY_CONFIG", default_value = "ferry.toml")]
    config: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch `location` from `server` into `dest_dir`, going through the
    /// cache when enabled.
    Fetch {
        server: String,
        location: String,
        dest_dir: PathBuf,
        /// Refetch even if already cached.
        #[arg(long)]
        refresh: bool,
    },
    /// Push `source` to `server`'s copy of `location`.
    Push {
        server: String,
        location: String,
        source: PathBuf,
    },
    /// Check whether `location` is present for `server`.
    Exists { server: String, location: String },
    /// Cache inspection subcommands.
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Debug, Subcommand)]
enum CacheCommand {
    /// Print every configured server's resolved cache entry.
    Show,
}

#[instrument]
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    ferry::error::register_known_codes();

    let top = TopLevelFlags::parse();
    log::make_logger(std::io::stderr).init();

    let config = ferry::config::Config::load(&top.config)
        .await
        .with_context(|| format!("load config: {}", top.config.display()))?;

    let mut tools = ferry::tools::ToolRegistry::new();
    for (name, tool) in &config.tool {
        tools.add(name.clone(), tool.path.clone(), tool.flags.clone().unwrap_or_default());
    }
    for name in ["rsync", "ssh", "scp", "curl", "mkdir"] {
        if !config.tool.contains_key(name) {
            tools.add(name, None, "");
        }
    }
    tools.init(&[])?;

    let cache = ferry::cache::setup_cache(&config)?;

    match top.command {
        Command::Fetch {
            server,
            location,
            dest_dir,
            refresh,
        } => {
            let flags = Flags {
                refresh,
                ..Flags::default()
            };
            ferry::cache::fetch_file(&cache, &tools, &server, &location, &dest_dir, None, &flags).await?;
            println!("fetched {server}:{location} -> {}", dest_dir.display());
        }
        Command::Push { server, location, source } => {
            ferry::cache::push_file(&cache, &tools, &source, &server, &location, &Flags::default()).await?;
            println!("pushed {} -> {server}:{location}", source.display());
        }
        Command::Exists { server, location } => {
            let present = ferry::cache::file_exists(&cache, &tools, &server, &location, &Flags::default()).await?;
            println!("{present}");
        }
        Command::Cache(CacheCommand::Show) => {
            for name in config.server.keys() {
                let Some(entry) = cache.by_server(name) else { continue };
                println!(
                    "{:<20} remote={} cache={} islocal={} writeback={}",
                    entry.server,
                    entry.remote_url,
                    entry.flags.cache,
                    entry.flags.islocal,
                    entry.flags.writeback(),
                );
            }
        }
    }

    Ok(())
}
