// ABOUTME: CLI entry point for mysql-datalayer
// ABOUTME: Lists datasets, reads change pages and writes entity documents from the command line

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use mysql_datalayer::entity::{write_document, EntityParser};
use mysql_datalayer::{ChangeIterator, Datalayer, LayerConfig};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mysql-datalayer")]
#[command(about = "Incremental change extraction and batched upserts for MySQL tables", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ConfigArgs {
    /// Path to the layer configuration (JSON)
    #[arg(long = "config", env = "DATALAYER_CONFIG")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured datasets
    Datasets {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Read one page of changes and print it as an entity document
    Changes {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        dataset: String,
        /// Continuation token from a previous page
        #[arg(long, default_value = "")]
        since: String,
        /// Maximum rows in the page (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        limit: usize,
        /// Only the newest state per entity (not supported)
        #[arg(long)]
        latest_only: bool,
    },
    /// Read entities; same as changes without latest-only
    Entities {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        dataset: String,
        #[arg(long, default_value = "")]
        from: String,
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },
    /// Write an entity document into the dataset's table
    Write {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        dataset: String,
        /// Entity document file (defaults to stdin)
        #[arg(long)]
        input: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Datasets { config } => {
            let layer = connect(&config).await?;
            for description in layer.dataset_descriptions() {
                println!("{}", description.name);
            }
            layer.stop().await.context("Failed to close database connection")?;
        }
        Commands::Changes {
            config,
            dataset,
            since,
            limit,
            latest_only,
        } => {
            let layer = connect(&config).await?;
            let iter = layer
                .dataset(&dataset)?
                .changes(&since, limit, latest_only)
                .await
                .with_context(|| format!("Failed to read changes from dataset {}", dataset))?;
            print_page(iter).await?;
            layer.stop().await.context("Failed to close database connection")?;
        }
        Commands::Entities {
            config,
            dataset,
            from,
            limit,
        } => {
            let layer = connect(&config).await?;
            let iter = layer
                .dataset(&dataset)?
                .entities(&from, limit)
                .await
                .with_context(|| format!("Failed to read entities from dataset {}", dataset))?;
            print_page(iter).await?;
            layer.stop().await.context("Failed to close database connection")?;
        }
        Commands::Write {
            config,
            dataset,
            input,
        } => {
            let reader: Box<dyn Read> = match &input {
                Some(path) => Box::new(
                    std::fs::File::open(path)
                        .with_context(|| format!("Failed to open {}", path.display()))?,
                ),
                None => Box::new(std::io::stdin().lock()),
            };
            let document = EntityParser::new()
                .with_expand_uris()
                .parse_reader(std::io::BufReader::new(reader))
                .context("Failed to parse entity document")?;

            let layer = connect(&config).await?;
            let mut writer = layer
                .dataset(&dataset)?
                .incremental()
                .await
                .with_context(|| format!("Failed to start writing to dataset {}", dataset))?;

            let count = document.entities.len();
            for entity in document.entities {
                writer
                    .write(entity)
                    .await
                    .with_context(|| format!("Failed to write to dataset {}", dataset))?;
            }
            writer
                .close()
                .await
                .with_context(|| format!("Failed to commit writes to dataset {}", dataset))?;
            tracing::info!("Wrote {} entities to {}", count, dataset);
            layer.stop().await.context("Failed to close database connection")?;
        }
    }

    Ok(())
}

async fn connect(args: &ConfigArgs) -> anyhow::Result<Datalayer> {
    let config = LayerConfig::load(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    Datalayer::connect(&config)
        .await
        .context("Failed to connect to MySQL")
}

/// Drain the iterator and print context, entities and continuation as one document.
async fn print_page(mut iter: ChangeIterator) -> anyhow::Result<()> {
    let mut entities = Vec::new();
    let drained = loop {
        match iter.next().await {
            Ok(Some(entity)) => entities.push(entity),
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    iter.close().await.context("Failed to close change cursor")?;
    drained.context("Failed to read changes")?;

    let token = iter.token();
    let document = write_document(&BTreeMap::new(), &entities, Some(&token));
    println!(
        "{}",
        serde_json::to_string_pretty(&document).context("Failed to render entity document")?
    );
    Ok(())
}
