mod benchmark;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kvcell::{Config, DType, ShiftMode};
use kvcell::workload::Workload;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kvcell", version, about = "Cell-based KV cache for batched multi-sequence decoding")]
struct Cli {
    /// Config file (defaults to $KVCELL_CONFIG, ./kvcell.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct CacheArgs {
    /// Number of cells
    #[arg(long)]
    capacity: Option<usize>,

    /// Transformer layers
    #[arg(long)]
    layers: Option<usize>,

    /// KV heads per layer
    #[arg(long)]
    heads: Option<usize>,

    /// Elements per head
    #[arg(long)]
    head_dim: Option<usize>,

    /// Arena storage type (f32, f16)
    #[arg(long)]
    dtype: Option<DType>,

    /// Position shift support (disabled, contiguous, arbitrary)
    #[arg(long)]
    shift_mode: Option<ShiftMode>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted multi-sequence decode against the cache
    Simulate {
        #[command(flatten)]
        cache: CacheArgs,

        /// Concurrent sequences at start
        #[arg(long)]
        sequences: Option<usize>,

        /// Decode steps
        #[arg(long)]
        steps: Option<usize>,

        /// Prompt tokens per sequence
        #[arg(long)]
        prefill: Option<usize>,

        /// Fork the first sequence every N steps (0 = never)
        #[arg(long)]
        fork_every: Option<usize>,

        /// Keep at most N tokens per sequence (0 = unlimited)
        #[arg(long)]
        window: Option<usize>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Time slot search, writes and defragmentation
    Bench {
        #[command(flatten)]
        cache: CacheArgs,

        /// Sequences decoded per step
        #[arg(long, default_value_t = 8)]
        batch: usize,

        /// Decode steps (capped by capacity / batch)
        #[arg(long, default_value_t = 128)]
        steps: usize,
    },
    /// Print a default config file
    Config,
}

impl CacheArgs {
    fn apply(&self, config: &mut Config) {
        let cache = &mut config.cache;
        if let Some(v) = self.capacity {
            cache.capacity = v;
        }
        if let Some(v) = self.layers {
            cache.n_layers = v;
        }
        if let Some(v) = self.heads {
            cache.n_kv_heads = v;
        }
        if let Some(v) = self.head_dim {
            cache.head_dim = v;
        }
        if let Some(v) = self.dtype {
            cache.dtype = v;
        }
        if let Some(v) = self.shift_mode {
            cache.shift_mode = v;
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(p) => Config::load_from_file(p),
        None => Config::load(),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Config => {
            print!("{}", Config::default_toml());
        }

        Commands::Simulate {
            cache,
            sequences,
            steps,
            prefill,
            fork_every,
            window,
            json,
        } => {
            let mut config = load_config(cli.config.as_ref())?;
            cache.apply(&mut config);
            let workload = &mut config.workload;
            if let Some(v) = sequences {
                workload.sequences = v;
            }
            if let Some(v) = steps {
                workload.steps = v;
            }
            if let Some(v) = prefill {
                workload.prefill = v;
            }
            if let Some(v) = fork_every {
                workload.fork_every = v;
            }
            if let Some(v) = window {
                workload.window = v;
            }
            if config.cache.capacity == 0 {
                anyhow::bail!("--capacity must be greater than zero");
            }

            info!(
                "KV cache: {} cells, {} layers, {:.2} MB of arenas ({})",
                config.cache.capacity,
                config.cache.n_layers,
                config.cache.arena_bytes() as f64 / (1024.0 * 1024.0),
                config.cache.dtype
            );
            let report = Workload::new(config.cache, config.workload).run()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report.to_json())?);
            } else {
                println!("{}", report);
            }
        }

        Commands::Bench {
            cache,
            batch,
            steps,
        } => {
            let mut config = load_config(cli.config.as_ref())?;
            cache.apply(&mut config);
            if config.cache.capacity == 0 || batch == 0 {
                anyhow::bail!("--capacity and --batch must be greater than zero");
            }
            benchmark::run_benchmark(&config.cache, batch, steps)?;
        }
    }

    Ok(())
}
