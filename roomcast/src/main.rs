//! Roomcast operator CLI
//!
//! Inspects what the HLS bridge would do with the current configuration and
//! prepares the output tree before a media server starts.
//!
//! # Usage
//!
//! ```bash
//! # Kill leftover transcoders and wipe the playlist root
//! roomcast --config roomcast.toml cleanup
//!
//! # Show the compositing graph for three participants
//! roomcast layout --participants 3
//!
//! # Show the full transcoder invocation for two participants
//! roomcast args --participants 2 --descriptor ./public/hls/room/stream.sdp
//! ```
//!
//! Every setting can be overridden with `ROOMCAST__<SECTION>__<KEY>`, for
//! example `ROOMCAST__HLS__BASE_PORT=40000`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use roomcast_core::{logging, Config};
use roomcast_hls::{cleanup, master_manifest, LayoutCompositor, Transcoder};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "roomcast", version, about = "WebRTC room to HLS bridge tooling")]
struct Cli {
    /// Configuration file (TOML or YAML)
    #[arg(short, long, env = "ROOMCAST_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reap leftover transcoders and reset the HLS output directory
    Cleanup,

    /// Print the compositing filter graph
    Layout {
        #[arg(short, long)]
        participants: usize,

        /// Output taps; defaults to the number of quality tiers
        #[arg(short, long)]
        outputs: Option<usize>,
    },

    /// Print the transcoder command line
    Args {
        #[arg(short, long)]
        participants: usize,

        /// Session descriptor the transcoder reads
        #[arg(short, long, default_value = "stream.sdp")]
        descriptor: PathBuf,
    },

    /// Print the top-level manifest for the configured tiers
    Manifest,

    /// Load and validate the configuration, then print it
    CheckConfig,
}

fn load_config(path: Option<&str>) -> Result<Config> {
    let config = Config::load(path).context("Failed to load configuration")?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        anyhow::bail!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        );
    }
    Ok(config)
}

/// Quote an argument for copy-pasting into a shell
fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:,+=%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    logging::init_logging(&config.logging)?;

    match cli.command {
        Command::Cleanup => {
            let reaped = cleanup::reset_output_root(&config)
                .await
                .context("Failed to reset HLS output directory")?;
            info!(
                reaped,
                playlist_dir = %config.hls.playlist_dir.display(),
                "Cleanup finished"
            );
        }
        Command::Layout {
            participants,
            outputs,
        } => {
            let outputs = outputs.unwrap_or(config.quality.tiers.len());
            let graph = LayoutCompositor::new(outputs).build(participants)?;
            println!("{graph}");
        }
        Command::Args {
            participants,
            descriptor,
        } => {
            let graph = LayoutCompositor::new(config.quality.tiers.len()).build(participants)?;
            let transcoder = Transcoder::new(config.transcoder.clone(), config.quality.tiers.clone());
            let command_line: Vec<String> = std::iter::once(config.transcoder.program.clone())
                .chain(config.transcoder.pre_args.iter().cloned())
                .chain(transcoder.build_args(&descriptor, &graph))
                .map(|arg| shell_quote(&arg))
                .collect();
            println!("{}", command_line.join(" "));
        }
        Command::Manifest => {
            print!("{}", master_manifest(&config.quality.tiers));
        }
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            eprintln!("Configuration is valid");
        }
    }

    Ok(())
}
