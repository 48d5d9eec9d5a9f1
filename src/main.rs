mod workflows;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use cadence_core::{CadenceConfig, Context};
use cadence_engine::ResiliencePolicy;

#[derive(Parser)]
#[command(
    name = "cadence",
    version,
    about = "Step workflows with retries, timeouts and circuit breaking"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "cadence.toml", env = "CADENCE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Count from zero to N, one number per tick
    Count {
        /// Last number to print
        #[arg(long, default_value = "10")]
        to: u64,
        /// Pause before every number
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Run a shell command under the configured retry/breaker policy
    Exec {
        /// Re-run the command every MS milliseconds until it trips the breaker
        #[arg(long, value_name = "MS")]
        every: Option<u64>,
        /// The command line, passed to `sh -c`
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Show the effective configuration
    Config {
        /// Print JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "cadence", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        CadenceConfig::load(&cli.config)?
    } else {
        CadenceConfig::default()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .init();

    if !cli.config.exists() {
        debug!(path = %cli.config.display(), "No config file, using defaults");
    }

    match cli.command {
        Commands::Config { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Count { to, interval_ms } => {
            let sink: workflows::Sink = Arc::new(|line: String| println!("{}", line));
            let step = workflows::count_to(to, interval_ms.map(Duration::from_millis), sink);
            cadence_engine::run(&run_context(&config), vec![step]).await?;
        }
        Commands::Exec { every, command } => {
            let policy = ResiliencePolicy::from_config(&config);
            let step = workflows::shell(command);
            let step = match every {
                Some(ms) => policy.guard_periodic(Duration::from_millis(ms), vec![step]),
                None => policy.guard_once(step),
            };
            cadence_engine::run(&run_context(&config), vec![step]).await?;
        }
        // Handled before config loading
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Root context for a CLI run: cancelled by Ctrl-C and bounded by the
/// configured run timeout.
fn run_context(config: &CadenceConfig) -> Context {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    // Cancel the run on Ctrl-C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Cancelling run...");
        cancel_clone.cancel();
    });

    let ctx = Context::with_token(cancel);
    match config.timeout.run_timeout() {
        Some(limit) => ctx.with_timeout(limit),
        None => ctx,
    }
}
