mod config;
mod scrape_cmd;
mod serve_cmd;
#[cfg(test)]
mod test_util;

use clap::{Parser, Subcommand};

use gmb_core::ScrapeQuery;
use gmb_core::query::DEFAULT_GRID_SIZE;

use config::GmbConfig;

#[derive(Parser)]
#[command(name = "gmb", about = "Business scraper relay: streams, aggregates and forwards worker results")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a gmb config file with a fresh API key
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Start the HTTP server
    Serve {
        /// Address to bind (overrides GMB_BIND and the config file)
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (overrides GMB_PORT and the config file)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one scrape in the foreground and print the result as JSON
    Scrape {
        /// Business activity to search for (e.g. "boulangerie")
        activity: String,
        /// City to search in
        city: String,
        /// Search grid size (N x N zones)
        #[arg(long, default_value_t = DEFAULT_GRID_SIZE)]
        grid_size: u32,
    },
}

/// Execute the `gmb init` command: write a config file with defaults.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let api_key = config::generate_api_key();
    let mut cfg = config::ConfigFile::default();
    cfg.auth.api_keys = vec![api_key.clone()];

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  server = {}:{}", cfg.server.bind, cfg.server.port);
    println!("  worker = {} {}", cfg.worker.program, cfg.worker.args.join(" "));
    println!("  auth.api_keys = [{}...{}]", &api_key[..8], &api_key[56..]);
    println!();
    println!("Next: run `gmb serve`.");

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            cmd_init(force)?;
        }
        Commands::Serve { bind, port } => {
            let resolved = GmbConfig::resolve(bind.as_deref(), port)?;
            serve_cmd::run_serve(&resolved).await?;
        }
        Commands::Scrape {
            activity,
            city,
            grid_size,
        } => {
            let resolved = GmbConfig::resolve(None, None)?;
            let launcher = resolved.launcher();
            let query = ScrapeQuery::new(activity, city, grid_size);
            if !scrape_cmd::run_scrape(&launcher, &query).await? {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
