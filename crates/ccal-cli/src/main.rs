use std::path::PathBuf;

use anyhow::{bail, Result};
use ccal_adapters::{FixtureFetcher, ParserRegistry};
use ccal_core::{Duplicatable, EntityKind, Event, RecordId, Source, Venue};
use ccal_storage::{Fetch, HttpFetcher, MemoryStore, Stored};
use ccal_sync::{
    squash_kind, DuplicateFinder, DuplicateGroup, DuplicateQuery, ImportConfig, ImportResult,
    Importer, SourceAttributes, SourceRegistry,
};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "ccal-cli")]
#[command(about = "Community calendar importer and duplicate maintenance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import upcoming events from one source URL.
    Import {
        url: String,
        #[arg(long)]
        title: Option<String>,
        /// Serve requests from a fixture directory with a routes.json index.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Import every enabled entry of sources.yaml.
    ImportAll {
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// List records grouped by a duplicate query: na, all, any, or field names.
    Duplicates {
        kind: EntityKind,
        #[arg(default_value = "na")]
        query: String,
    },
    /// Squash duplicates into a primary record.
    Squash {
        kind: EntityKind,
        #[arg(long)]
        primary: Option<RecordId>,
        #[arg(long, value_delimiter = ',')]
        duplicates: Vec<RecordId>,
    },
    /// Show a record, resolved to its primary when it was squashed.
    Show { kind: EntityKind, id: RecordId },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ccal=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = ImportConfig::from_env()?;
    let mut store = MemoryStore::load(&config.db_path).await?;

    match cli.command {
        Commands::Import {
            url,
            title,
            fixtures,
        } => {
            let fetcher = fetcher_for(&config, fixtures)?;
            let registry = ParserRegistry::default();
            let parser_config = config.parser_config();
            let importer = Importer::new(&registry, fetcher.as_ref(), &parser_config);
            let result = importer
                .import(&mut store, SourceAttributes { url, title })
                .await;
            print_import(&store, &result);
            store.persist(&config.db_path).await?;
            if !result.is_success() {
                bail!(result.message());
            }
        }
        Commands::ImportAll { fixtures } => {
            let sources = SourceRegistry::load(&config.workspace_root).await?;
            let fetcher = fetcher_for(&config, fixtures)?;
            let registry = ParserRegistry::default();
            let parser_config = config.parser_config();
            let importer = Importer::new(&registry, fetcher.as_ref(), &parser_config);
            let results = importer.import_all(&mut store, &sources).await;
            for result in &results {
                print_import(&store, result);
            }
            store.persist(&config.db_path).await?;
            let failed = results.iter().filter(|r| !r.is_success()).count();
            info!(total = results.len(), failed, "batch import finished");
        }
        Commands::Duplicates { kind, query } => {
            let query = DuplicateQuery::parse(&query)?;
            let finder = DuplicateFinder::new(config.duplicate_strategy);
            match kind {
                EntityKind::Event => print_groups(kind, &finder.query::<Event>(&store, &query, &[])?),
                EntityKind::Venue => print_groups(kind, &finder.query::<Venue>(&store, &query, &[])?),
                EntityKind::Source => {
                    print_groups(kind, &finder.query::<Source>(&store, &query, &[])?)
                }
            }
        }
        Commands::Squash {
            kind,
            primary,
            duplicates,
        } => {
            let outcome = squash_kind(&mut store, kind, primary, &duplicates)?;
            store.persist(&config.db_path).await?;
            println!("{}", outcome.message());
        }
        Commands::Show { kind, id } => match kind {
            EntityKind::Event => show::<Event>(&store, id)?,
            EntityKind::Venue => show::<Venue>(&store, id)?,
            EntityKind::Source => show::<Source>(&store, id)?,
        },
    }

    Ok(())
}

fn fetcher_for(config: &ImportConfig, fixtures: Option<PathBuf>) -> Result<Box<dyn Fetch>> {
    Ok(match fixtures {
        Some(dir) => Box::new(FixtureFetcher::from_dir(dir)?),
        None => Box::new(HttpFetcher::new(config.http_config())?),
    })
}

fn print_import(store: &MemoryStore, result: &ImportResult) {
    println!("{} [{}] {}", result.url, result.import_id, result.message());
    for id in &result.events {
        if let Some(event) = store.get::<Event>(*id) {
            let start = event
                .start_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            println!("  [{id}] {start} {}", event.title);
        }
    }
}

fn print_groups<T: Duplicatable>(kind: EntityKind, groups: &[DuplicateGroup<'_, T>]) {
    if groups.is_empty() {
        println!("no {} found", kind.plural());
        return;
    }
    for group in groups {
        if group.key.is_empty() {
            println!("all {} ({})", kind.plural(), group.len());
        } else {
            let key: Vec<String> = group
                .key
                .iter()
                .map(|(field, value)| format!("{field}={value}"))
                .collect();
            println!("{} ({})", key.join(", "), group.len());
        }
        for record in &group.records {
            let id = record.id().map(|id| id.to_string()).unwrap_or_default();
            println!("  [{id}] {}", record.title());
        }
    }
}

fn show<T: Stored>(store: &MemoryStore, id: RecordId) -> Result<()> {
    let record = store.fetch::<T>(id)?;
    let primary = store.originator::<T>(id)?;
    println!("{} {id}: {}", T::kind(), record.title());
    if let Some(primary_id) = primary.id().filter(|p| *p != id) {
        println!("  duplicate of {} {primary_id}, showing its values", T::kind());
    }
    for (field, value) in primary.comparable_attributes() {
        if !value.is_null() {
            println!("  {field}: {value}");
        }
    }
    if let Some(tags) = primary.tags().filter(|t| !t.is_empty()) {
        println!("  tags: {tags}");
    }
    Ok(())
}
