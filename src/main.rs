use api::{HttpApi, SystemClock};
use clap::Parser;
use config::{Cli, Command, Config};
use pipeline::Pipeline;
use tracing_subscriber::EnvFilter;
use write::render_report;

mod activity;
mod api;
mod combine;
mod compute;
mod config;
mod data;
mod download;
mod layout;
mod period;
mod pipeline;
mod read;
mod search;
mod write;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "usaspending_tas=debug,info"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::resolve(&cli)?;
    let api = HttpApi::new(&config.api_base, config.request_timeout)?;
    let pipeline = Pipeline::new(&config, &api, &SystemClock)?;
    if let Some(report) = pipeline.run(cli.command.unwrap_or(Command::Run)).await? {
        print!("{}", render_report(&report));
    }
    Ok(())
}
