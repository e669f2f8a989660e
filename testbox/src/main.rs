use anyhow::Result;

mod cli;
mod config;
mod logging;

fn main() -> Result<()> {
    cli::execute()
}
