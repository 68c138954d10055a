use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loop_counters::{CliArgs, Command, Config, WriteStrategy};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "loop-counters")]
#[command(about = "Sharded aggregate counters over a document store snapshot")]
struct Cli {
    #[arg(short, long, help = "Increase verbosity")]
    verbose: bool,

    #[arg(long, global = true, env = "LOOP_COUNTERS_CONFIG", help = "Config file (TOML or JSON)")]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        default_value = "./loop-counters.json",
        help = "Store snapshot file"
    )]
    data: PathBuf,

    #[arg(long, global = true, help = "Shards per parent")]
    shards: Option<u32>,

    #[arg(long, global = true, help = "auto, upsert or read_then_write")]
    write_strategy: Option<WriteStrategy>,

    #[arg(long, global = true, default_value = "default", help = "Counter family name")]
    family: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create every shard of a parent with the given fields at 0
    Init {
        #[arg(long)]
        parent: String,
        #[arg(long, value_delimiter = ',', required = true)]
        fields: Vec<String>,
    },
    /// Add to a counter field
    Incr {
        #[arg(long)]
        parent: String,
        #[arg(long)]
        field: String,
        #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
        delta: i64,
    },
    /// Print one counter, or all counters of a parent
    Get {
        #[arg(long)]
        parent: String,
        #[arg(long)]
        field: Option<String>,
    },
    /// Check the stored shard count of a parent against the configured one
    Verify {
        #[arg(long)]
        parent: String,
    },
}

impl From<Commands> for Command {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Init { parent, fields } => Command::Init { parent, fields },
            Commands::Incr {
                parent,
                field,
                delta,
            } => Command::Incr {
                parent,
                field,
                delta,
            },
            Commands::Get { parent, field } => Command::Get { parent, field },
            Commands::Verify { parent } => Command::Verify { parent },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        config_file: cli.config.clone(),
        shards: cli.shards,
        write_strategy: cli.write_strategy,
        log_level: cli.verbose.then(|| "debug".to_string()),
    };
    let config = Config::load_with_cli(&args).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let output = loop_counters::run(config, &cli.data, &cli.family, cli.command.into()).await?;
    if !output.is_empty() {
        println!("{}", output);
    }
    Ok(())
}
