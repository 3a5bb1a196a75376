use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use scanhost::config::{ConfigManager, EngineConfig, EnvConfigManager};
use scanhost::logger::{LogConfig, init_tracing};
use scanhost::scan_plugin::{EntryKind, PluginMetadata};
use scanhost::schema::write_schema;
use scanhost::store::{FilePluginStore, PluginStore};
use scanhost::watcher::PluginDirectory;
use scanhost::{PluginEngine, engine::validate_source};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "scanhost", about = "Run and validate scanning plugins in isolated workers", version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Log filter, e.g. `info` or `scanhost=debug,plugin=trace`
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Write logs to files in this directory instead of stderr
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// OpenTelemetry OTLP/HTTP endpoint
    #[arg(long, global = true)]
    otel_endpoint: Option<String>,

    /// `.env` file with SCANHOST_* overrides
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check a plugin file without running it
    Validate { file: PathBuf },

    /// Run a plugin file once, or repeatedly with --runs
    Run(RunArgs),

    /// Load every plugin in a directory and hot-reload on change
    Watch(WatchArgs),

    /// Emit JSON-Schema for the engine's public types
    Schema { out_dir: PathBuf },
}

#[derive(Args, Debug)]
struct RunArgs {
    file: PathBuf,

    /// Entry point to call
    #[arg(long, default_value = "scan_request")]
    kind: EntryKind,

    /// JSON file passed to the entry point
    #[arg(long)]
    context: Option<PathBuf>,

    #[arg(long, default_value_t = 1)]
    runs: usize,

    #[arg(long, default_value_t = 1)]
    concurrency: usize,
}

#[derive(Args, Debug)]
struct WatchArgs {
    dir: PathBuf,

    /// Persist plugin records here and restore them on start
    #[arg(long)]
    store: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let telemetry = init_tracing(&LogConfig {
        log_level: cli.global.log_level.clone(),
        log_dir: cli.global.log_dir.clone(),
        otel_endpoint: cli.global.otel_endpoint.clone(),
    })?;

    let outcome = match cli.command {
        Commands::Validate { file } => validate(file).await,
        Commands::Run(args) => run(&cli.global, args).await,
        Commands::Watch(args) => watch(&cli.global, args).await,
        Commands::Schema { out_dir } => {
            for file in write_schema(&out_dir)? {
                println!("{}", out_dir.join(file).display());
            }
            Ok(())
        }
    };

    telemetry.shutdown();
    outcome
}

async fn load_config(global: &GlobalArgs) -> EngineConfig {
    let mgr = ConfigManager(EnvConfigManager::new(global.env_file.clone()));
    EngineConfig::load(&mgr).await
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn plugin_id(file: &std::path::Path) -> anyhow::Result<String> {
    file.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .with_context(|| format!("cannot derive a plugin id from {}", file.display()))
}

async fn validate(file: PathBuf) -> anyhow::Result<()> {
    let source = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let result = validate_source(&source);
    print_json(&result)?;
    if !result.is_valid {
        bail!("{} is not a valid plugin", file.display());
    }
    Ok(())
}

async fn run(global: &GlobalArgs, args: RunArgs) -> anyhow::Result<()> {
    let source = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("reading {}", args.file.display()))?;
    let context: Value = match &args.context {
        Some(path) => serde_json::from_slice(&tokio::fs::read(path).await?)
            .with_context(|| format!("parsing {}", path.display()))?,
        None => Value::Object(Default::default()),
    };

    let engine = PluginEngine::new(load_config(global).await, PluginStore::memory())?;
    let id = plugin_id(&args.file)?;
    engine.create_plugin(PluginMetadata::new(id.clone(), id.clone(), "0.0.0"), source).await?;
    engine.enable_plugin(&id).await?;

    if args.runs > 1 {
        let result = engine.run_advanced(&id, args.kind, context, args.runs, args.concurrency).await?;
        print_json(&result)?;
    } else {
        let result = engine.submit_execution(&id, args.kind, context).await?;
        print_json(&result)?;
    }
    engine.shutdown().await;
    Ok(())
}

async fn watch(global: &GlobalArgs, args: WatchArgs) -> anyhow::Result<()> {
    let store = match args.store {
        Some(dir) => PluginStore(Arc::new(FilePluginStore::new(dir)?)),
        None => PluginStore::memory(),
    };
    let engine = Arc::new(PluginEngine::start(load_config(global).await, store).await?);

    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{line}");
            }
        }
    });

    let watcher = PluginDirectory::new(engine.clone()).watch(args.dir.clone()).await?;
    info!(dir = %args.dir.display(), "watching plugins; press Ctrl-C to exit");
    eprintln!("watching {}; press Ctrl-C to exit", args.dir.display());

    tokio::signal::ctrl_c().await?;

    watcher.shutdown();
    printer.abort();
    engine.shutdown().await;
    Ok(())
}
