mod probe;
mod send;

use std::{num::ParseIntError, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use probe::ProbeCommand;
use send::SendCommand;

use crate::{config::HarnessConfig, logging};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    color: colorchoice_clap::Color,

    #[command(subcommand)]
    command: Commands,

    /// Output plain JSON without color and interactivity
    #[arg(short, long, global = true)]
    json: bool,

    /// Read the harness configuration from this TOML file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    Probe(ProbeCommand),
    Send(SendCommand),
}

pub fn execute() -> Result<()> {
    let cli = Cli::parse();

    cli.color.write_global();

    let config = match &cli.config {
        Some(path) => HarnessConfig::load(path)?,
        None => HarnessConfig::default(),
    };
    logging::init(&config.log_level)?;

    match &cli.command {
        Commands::Probe(cmd) => cmd.execute(&cli, &config),
        Commands::Send(cmd) => cmd.execute(&cli, &config),
    }
}

fn parse_hex_u16(s: &str) -> Result<u16, ParseIntError> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16)
}

fn parse_hex_u8(s: &str) -> Result<u8, ParseIntError> {
    u8::from_str_radix(s.trim_start_matches("0x"), 16)
}

/// Parses bytes written as hex digits, optionally separated by spaces or
/// colons.
fn parse_hex_bytes(s: &str) -> Result<Vec<u8>> {
    let digits: String = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();

    hex::decode(&digits).with_context(|| format!("{s:?} is not hex"))
}
