//! `streamrelay` CLI - run the proxy, resolve a source, decrypt a segment

mod cmd;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "streamrelay")]
#[command(about = "Streaming media proxy: resolve, rewrite, relay and decrypt HLS/DASH")]
#[command(version)]
struct Cli {
    /// TOML configuration file (environment variables override it)
    #[arg(short, long, global = true, env = "STREAMRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP proxy
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Resolve a source URL and print the stream as JSON
    Resolve {
        /// Source URL (hoster page, HLS or MPD)
        url: String,

        /// Extra upstream header, `Name: value` (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Force a service instead of detecting it from the URL
        #[arg(long)]
        host: Option<String>,
    },

    /// Decrypt a CENC media segment with ClearKey material
    Decrypt {
        /// Encrypted init segment
        #[arg(long)]
        init: PathBuf,

        /// Encrypted media segment; omit to write only the clear init
        #[arg(long)]
        segment: Option<PathBuf>,

        /// `KID:KEY` pairs, comma separated
        #[arg(short, long)]
        key: String,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve { port, bind } => {
            cmd::serve::cmd_serve(cli.config.as_deref(), port, bind).await?;
        }
        Commands::Resolve { url, headers, host } => {
            cmd::resolve::cmd_resolve(cli.config.as_deref(), &url, &headers, host.as_deref()).await?;
        }
        Commands::Decrypt { init, segment, key, output } => {
            cmd::decrypt::cmd_decrypt(&init, segment.as_deref(), &key, output.as_deref())?;
        }
    }

    Ok(())
}
