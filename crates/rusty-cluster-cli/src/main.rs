mod crawl;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;

use rusty_cluster_core::Config;

use crate::crawl::{EngineKind, OptionOverrides};

#[derive(Parser)]
#[command(
    name = "rusty-cluster",
    about = "Crawl pages with a bounded pool of browser workers",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load every URL and print its title as a JSON line
    Crawl {
        /// URLs to load
        urls: Vec<String>,

        /// Read more URLs from a file, one per line
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Browser engine
        #[arg(long, value_enum, default_value_t = default_engine())]
        engine: EngineKind,

        /// Print Prometheus metrics when done
        #[arg(long)]
        metrics: bool,

        #[command(flatten)]
        overrides: OptionOverrides,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check the configuration for problems
    Validate,
}

fn default_engine() -> EngineKind {
    if cfg!(feature = "browser") {
        EngineKind::Chromium
    } else {
        EngineKind::Memory
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;

    logging::init(&config.logging.clone().unwrap_or_default(), cli.verbose);

    match cli.command {
        Commands::Crawl {
            urls,
            file,
            engine,
            metrics,
            overrides,
        } => {
            let handle = if metrics {
                Some(PrometheusBuilder::new().install_recorder()?)
            } else {
                None
            };

            let urls = crawl::collect_urls(&urls, file.as_deref())?;
            let options = overrides.apply(config.cluster_options());
            tracing::info!(
                urls = urls.len(),
                concurrency = ?options.concurrency,
                max_concurrency = options.max_concurrency,
                "Starting crawl"
            );
            let report =
                crawl::run(urls, options, config.launch_options(), crawl::engine(engine)?).await?;
            if !report.failed.is_empty() {
                tracing::warn!(
                    failed = report.failed.len(),
                    pages = report.pages,
                    "Some pages could not be loaded"
                );
            }

            if let Some(handle) = handle {
                print!("{}", handle.render());
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("Config: {}", config_path.display());
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} config error(s) in {}", errors.len(), config_path.display());
                }
                println!("Config OK ({} warning(s))", warnings.len());
            }
        },
    }

    Ok(())
}
