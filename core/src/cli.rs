use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use crate::application::{initialize, InitOptions};
use crate::config::Config;
use crate::recipe::{validator, Recipe};
use crate::registry::OperationRegistry;
use crate::settings::{PoolSettings, SettingsStore, TomlSettingsStore};
use crate::types::{ExecutionOutcome, Tag, Value};

#[derive(Parser)]
#[command(name = "sous")]
#[command(about = "Sous - run typed transformation recipes on a bounded worker pool", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the persisted pool settings file (overrides config file and env vars)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a recipe on one input
    Bake {
        /// Recipe text, e.g. "trim | uppercase | repeat(2, separator=\" \")"
        recipe: Option<String>,

        /// Read the recipe from a file (JSON if it ends in .json, text otherwise)
        #[arg(short = 'f', long = "recipe-file", conflicts_with = "recipe")]
        recipe_file: Option<PathBuf>,

        /// Input value
        #[arg(short = 'i', long = "input")]
        input: String,

        /// Input type: string, number, bytes (hex)
        #[arg(short = 't', long = "input-type", default_value = "string")]
        input_type: Tag,

        /// Print the value after every step (runs in-process, outside the pool)
        #[arg(long)]
        trace: bool,

        /// Print the full execution record as JSON
        #[arg(long, conflicts_with = "trace")]
        json: bool,
    },

    /// Type-check a recipe without running it
    Validate {
        recipe: Option<String>,

        #[arg(short = 'f', long = "recipe-file", conflicts_with = "recipe")]
        recipe_file: Option<PathBuf>,

        /// Also check that the recipe accepts this input type
        #[arg(short = 't', long = "input-type")]
        input_type: Option<Tag>,
    },

    /// List registered operations
    Ops {
        #[arg(long)]
        json: bool,
    },

    /// Show or change persisted pool settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Run a throughput benchmark against an in-process pool
    Bench {
        /// Number of requests to submit
        #[arg(long, default_value = "10000")]
        requests: usize,

        /// Number of concurrent submitters
        #[arg(long, default_value = "16")]
        concurrency: usize,

        #[arg(long, default_value = "upper_first | uppercase | reverse")]
        recipe: String,

        #[arg(long, default_value = "hello world")]
        input: String,

        #[arg(long, default_value = "string")]
        input_type: Tag,

        /// Pool size for this run (defaults to persisted settings)
        #[arg(long)]
        pool_size: Option<usize>,

        /// Queue capacity for this run (defaults to persisted settings)
        #[arg(long)]
        max_queue_length: Option<usize>,

        /// Benchmark timeout (e.g., "60s", "5m")
        #[arg(long)]
        duration: Option<String>,

        /// Target submit rate (requests/sec)
        #[arg(long)]
        rate: Option<f64>,

        /// Warmup percentage: exclude first N% of requests from latency metrics
        #[arg(long, default_value = "0")]
        warmup_percent: f64,
    },
}

#[derive(Subcommand)]
pub enum SettingsAction {
    /// Print the settings a pool would start with
    Show,

    /// Update and persist pool settings
    Set {
        #[arg(long)]
        pool_size: Option<usize>,

        #[arg(long)]
        max_queue_length: Option<usize>,
    },
}

/// Run the CLI by parsing process arguments
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli).await
}

/// Run the CLI with provided arguments
pub async fn run_cli_from_args(args: Vec<String>) -> Result<()> {
    let cli = Cli::parse_from(args);
    run_cli_with_args(cli).await
}

/// Install the global subscriber; `RUST_LOG` wins over the configured filter
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // A subscriber may already be installed by an embedding host
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run_cli_with_args(cli: Cli) -> Result<()> {
    // Load config eagerly so errors show before any command output
    let config = Config::builder()
        .config_path(cli.config.clone())
        .settings_path(cli.settings.clone())
        .build()?;
    init_tracing(&config.log.filter);

    let init_options = InitOptions {
        config_path: cli.config,
        settings_path: cli.settings,
        ..Default::default()
    };

    match cli.command {
        Commands::Bake {
            recipe,
            recipe_file,
            input,
            input_type,
            trace,
            json,
        } => {
            let recipe = load_recipe(recipe, recipe_file.as_deref())?;
            let input = Value::parse_as(input_type, &input).map_err(|e| anyhow!(e))?;

            if trace {
                // Runs in-process: the pool only reports the final outcome
                let registry = OperationRegistry::with_builtins();
                let typed = validator::validate_for_input(&recipe, &registry, input.tag())?;
                let values = crate::executor::execute_traced(&typed, &registry, input.clone())?;

                println!("  input: {} ({})", input, input.tag());
                for (step, value) in typed.steps().iter().zip(&values) {
                    println!("  {} -> {} ({})", step.op_id, value, value.tag());
                }
                return Ok(());
            }

            let app = initialize(init_options).await?;
            let result = bake(app.pool(), &recipe, input, json).await;
            app.shutdown().await;
            result?;
        }

        Commands::Validate {
            recipe,
            recipe_file,
            input_type,
        } => {
            let recipe = load_recipe(recipe, recipe_file.as_deref())?;
            let registry = OperationRegistry::with_builtins();
            let typed = validator::validate(&recipe, &registry)?;
            if let Some(tag) = input_type {
                typed.check_input(tag)?;
            }

            println!("✓ Recipe is valid ({} step(s))", typed.len());
            for (index, step) in typed.steps().iter().enumerate() {
                let accepts: Vec<&str> = step.input_tags.iter().map(Tag::as_str).collect();
                println!(
                    "  {}: {} [{}] -> {}",
                    index,
                    step.op_id,
                    accepts.join("|"),
                    step.output_tag
                );
            }
            if let Some(tag) = input_type {
                println!("  {} in, {} out", tag, typed.output_tag(tag));
            }
            println!("  fingerprint: {}", typed.fingerprint());
        }

        Commands::Ops { json } => {
            let registry = OperationRegistry::with_builtins();
            if json {
                let ops: Vec<serde_json::Value> = registry
                    .iter()
                    .map(|op| {
                        serde_json::json!({
                            "id": op.id,
                            "name": op.name,
                            "description": op.description,
                            "input_tags": op.input_tags,
                            "output_tag": op.output_tag,
                            "params": op.params,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&ops)?);
                return Ok(());
            }

            println!("Found {} operation(s):\n", registry.len());
            for op in registry.iter() {
                let accepts: Vec<&str> = op.input_tags.iter().map(Tag::as_str).collect();
                let params: Vec<String> = op
                    .params
                    .iter()
                    .map(|p| match &p.default {
                        Some(default) => format!("{}: {} = {}", p.name, p.kind, default),
                        None => format!("{}: {}", p.name, p.kind),
                    })
                    .collect();
                println!(
                    "  {}({}) | {} -> {} | {}",
                    op.id,
                    params.join(", "),
                    accepts.join("|"),
                    op.output_tag,
                    op.description
                );
            }
        }

        Commands::Settings { action } => {
            let store = TomlSettingsStore::new(&config.settings_path);

            match action {
                SettingsAction::Show => {
                    let (settings, source) = match store.load()? {
                        Some(saved) => (saved, store.path().display().to_string()),
                        None => (config.pool, "config defaults".to_string()),
                    };
                    println!("Pool settings (from {}):", source);
                    println!("  pool_size: {}", settings.pool_size);
                    println!("  max_queue_length: {}", settings.max_queue_length);
                }
                SettingsAction::Set {
                    pool_size,
                    max_queue_length,
                } => {
                    if pool_size.is_none() && max_queue_length.is_none() {
                        return Err(anyhow!(
                            "Nothing to change. Pass --pool-size and/or --max-queue-length"
                        ));
                    }

                    let app = initialize(init_options).await?;
                    let current = app.pool().settings();
                    let updated = PoolSettings::new(
                        pool_size.unwrap_or(current.pool_size),
                        max_queue_length.unwrap_or(current.max_queue_length),
                    )?;
                    let applied = app.pool().apply_settings(updated);
                    app.shutdown().await;
                    applied.context("Failed to update pool settings")?;

                    println!(
                        "✓ Saved pool_size={} max_queue_length={} to {}",
                        updated.pool_size,
                        updated.max_queue_length,
                        store.path().display()
                    );
                }
            }
        }

        Commands::Bench {
            requests,
            concurrency,
            recipe,
            input,
            input_type,
            pool_size,
            max_queue_length,
            duration,
            rate,
            warmup_percent,
        } => {
            use crate::benchmark;

            let app = initialize(init_options).await?;
            let current = app.pool().settings();
            // Overrides apply to this run only; nothing is persisted
            app.pool().resize(pool_size.unwrap_or(current.pool_size))?;
            app.pool()
                .set_max_queue_length(max_queue_length.unwrap_or(current.max_queue_length));

            let params = benchmark::BenchmarkParams {
                requests,
                concurrency,
                recipe,
                input,
                input_type,
                duration,
                rate,
                warmup_percent,
            };

            println!("🚀 Starting Sous Benchmark");
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            let result = benchmark::run_benchmark(app.pool(), &params).await;
            app.shutdown().await;
            benchmark::display_report(&params, &result?);
        }
    }

    Ok(())
}

async fn bake(
    pool: &crate::pool::PoolController,
    recipe: &Recipe,
    input: Value,
    json: bool,
) -> Result<()> {
    let id = pool.submit(recipe, input)?;
    let outcome = pool
        .wait(&id)
        .await
        .ok_or_else(|| anyhow!("Request {} vanished before completing", id))?;

    if json {
        let record = pool
            .record(&id)
            .ok_or_else(|| anyhow!("Request {} not found", id))?;
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    match outcome {
        ExecutionOutcome::Success(value) => {
            println!("{}", value);
            Ok(())
        }
        ExecutionOutcome::Failure(err) => Err(err.into()),
        ExecutionOutcome::Cancelled => Err(anyhow!("Request {} was cancelled", id)),
    }
}

/// Recipe from inline text or a file; exactly one source is required
fn load_recipe(text: Option<String>, file: Option<&Path>) -> Result<Recipe> {
    match (text, file) {
        (Some(text), None) => Ok(Recipe::from_text(&text)?),
        (None, Some(path)) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read recipe file {}", path.display()))?;
            if path.extension().is_some_and(|ext| ext == "json") {
                serde_json::from_str(&contents)
                    .with_context(|| format!("Invalid JSON recipe {}", path.display()))
            } else {
                Recipe::from_text(&contents)
                    .with_context(|| format!("Invalid recipe {}", path.display()))
            }
        }
        (None, None) => Err(anyhow!("Provide a recipe or --recipe-file")),
        (Some(_), Some(_)) => Err(anyhow!("Provide either a recipe or --recipe-file, not both")),
    }
}
