//! Provenance CLI - local model inventory, registry identities and recipes.
//!
//! Every command prints its result as JSON on stdout. Logs go to stderr.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use provenance_core::{
    CacheKind, FolderLayout, IdentityKey, ImageQuery, ImageSort, MediaFilter, ModelCategory,
    NsfwLevel, ProvenanceEngine, RegistryDomain,
};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "provenance")]
#[command(about = "Resolve local model files against the registry and extract generation recipes")]
struct Args {
    /// Directory holding the database (defaults to the platform data directory)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Models root with one subdirectory per category
    #[arg(long, global = true)]
    models_dir: Option<PathBuf>,

    /// Registry mirror: com or work (defaults to the stored choice)
    #[arg(long, global = true)]
    domain: Option<String>,

    /// Registry API key
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Hash new and modified model files
    Sync {
        /// Category to sync (all categories when omitted)
        #[arg(short, long)]
        category: Option<String>,

        /// Ignore the refresh interval
        #[arg(short, long)]
        force: bool,

        /// Hash every file again, ignoring stored modification times
        #[arg(long, requires = "category")]
        rehash: bool,
    },

    /// List the files of a category with their registry names
    List { category: String },

    /// Resolve a hash or a local file to its registry version
    Resolve {
        /// SHA-256 hash or path to a model file
        target: String,

        /// Ask the registry even when a stored answer exists
        #[arg(short, long)]
        refresh: bool,

        /// Print trigger words from the file header and the registry
        #[arg(long)]
        words: bool,
    },

    /// Extract recipes from a JSON file holding one metadata object or an array of them
    Extract { file: PathBuf },

    /// Analyze the published sample outputs of a version
    Analyze {
        /// SHA-256 hash of the subject model file
        hash: String,

        #[arg(short, long, default_value_t = 50)]
        limit: usize,

        /// most_reactions, most_comments or newest
        #[arg(long)]
        sort: Option<String>,

        /// none, soft, mature or x
        #[arg(long)]
        nsfw: Option<String>,

        /// image, video or all
        #[arg(long)]
        media: Option<String>,

        /// Bypass the stored analysis
        #[arg(short, long)]
        force: bool,
    },

    /// Look up every local hash never checked against the registry
    FetchMissing,

    /// Import JSON hash caches written by older releases
    Migrate,

    /// Clear cached data: analysis, api, triggers or all
    Clear { kind: String },

    /// Print row counts of the store
    Stats,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("provenance"))
        .unwrap_or_else(|| PathBuf::from(provenance_core::config::PathsConfig::DATA_DIR_NAME))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_category(s: &str) -> Result<ModelCategory> {
    Ok(ModelCategory::parse(s)?)
}

fn build_query(
    limit: usize,
    sort: Option<&str>,
    nsfw: Option<&str>,
    media: Option<&str>,
) -> Result<ImageQuery> {
    let mut query = ImageQuery {
        limit,
        ..ImageQuery::default()
    };
    if let Some(s) = sort {
        query.sort = ImageSort::parse(s).ok_or_else(|| anyhow!("Unknown sort order: {}", s))?;
    }
    if let Some(s) = nsfw {
        query.nsfw = NsfwLevel::parse(s).ok_or_else(|| anyhow!("Unknown nsfw level: {}", s))?;
    }
    if let Some(s) = media {
        query.media =
            MediaFilter::parse(s).ok_or_else(|| anyhow!("Unknown media filter: {}", s))?;
    }
    Ok(query)
}

fn identity_key(target: &str) -> IdentityKey {
    let path = Path::new(target);
    if path.is_file() {
        IdentityKey::path(path)
    } else {
        IdentityKey::hash(target)
    }
}

fn read_records(file: &Path) -> Result<Vec<Value>> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("Invalid JSON in {}", file.display()))?;
    Ok(match value {
        Value::Array(records) => records,
        other => vec![other],
    })
}

async fn run(engine: &ProvenanceEngine, command: Command) -> Result<()> {
    match command {
        Command::Sync {
            category,
            force,
            rehash,
        } => match category {
            Some(name) => {
                let category = parse_category(&name)?;
                let report = if rehash {
                    engine.rehash_all(category).await?
                } else {
                    engine.sync(category, force).await?
                };
                print_json(&report)
            }
            None => print_json(&engine.sync_all(force).await),
        },

        Command::List { category } => {
            let category = parse_category(&category)?;
            print_json(&engine.local_models(category)?)
        }

        Command::Resolve {
            target,
            refresh,
            words,
        } => {
            let key = identity_key(&target);
            if words {
                return print_json(&engine.trigger_words(&key, refresh).await?);
            }
            let record = if refresh {
                engine.refresh_identity(&key).await?
            } else {
                engine.resolve_identity(&key).await?
            };
            match record {
                Some(record) => print_json(&record),
                None => {
                    warn!("No registry identity for {}", target);
                    print_json(&Value::Null)
                }
            }
        }

        Command::Extract { file } => {
            let records = read_records(&file)?;
            info!("Extracting {} record(s)", records.len());
            let recipes = engine.extract_recipes(&records).await?;
            if recipes.len() == 1 {
                print_json(&recipes[0])
            } else {
                print_json(&recipes)
            }
        }

        Command::Analyze {
            hash,
            limit,
            sort,
            nsfw,
            media,
            force,
        } => {
            let query = build_query(limit, sort.as_deref(), nsfw.as_deref(), media.as_deref())?;
            let report = engine.analyze(&hash, &query, force).await?;
            print_json(&report)
        }

        Command::FetchMissing => print_json(&engine.fetch_missing_remote_info().await?),

        Command::Migrate => {
            let report = engine.migrate_legacy_caches()?;
            if !report.found_any() {
                info!("No legacy caches found");
            }
            print_json(&report)
        }

        Command::Clear { kind } => {
            let kind = CacheKind::parse(&kind).ok_or_else(|| anyhow!("Unknown cache: {}", kind))?;
            let cleared = engine.clear_cache(kind)?;
            print_json(&serde_json::json!({ "cleared": cleared }))
        }

        Command::Stats => print_json(&engine.stats()?),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let data_dir = args.data_dir.unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    info!("Data directory: {}", data_dir.display());

    let mut builder = ProvenanceEngine::builder(&data_dir).with_api_key(args.api_key);
    if let Some(models_dir) = &args.models_dir {
        builder = builder.with_provider(FolderLayout::from_models_root(models_dir));
    }
    if let Some(domain) = &args.domain {
        builder = builder.with_domain(domain.parse::<RegistryDomain>()?);
    }
    let engine = builder.build()?;

    let outcome = run(&engine, args.command).await;
    engine.close()?;
    outcome
}
