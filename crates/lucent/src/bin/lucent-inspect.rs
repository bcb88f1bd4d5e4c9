//! Lucent archive and schedule inspector
//!
//! ## Usage
//!
//! ```bash
//! # Summarize an SD 1.5 archive
//! lucent-inspect tensors.tar
//!
//! # SD 2.1 archive as JSON, previewing 16 values per tensor
//! lucent-inspect tensors.tar --variant sd21 --preview 16 --json
//!
//! # Compare the solver's 20-step timesteps with the archive's
//! lucent-inspect tensors.tar --timesteps 20
//!
//! # Use an engine configuration instead of an archive path
//! lucent-inspect --config engine.json
//! ```

use clap::{Parser, ValueEnum};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use lucent_archive::{TensorRepository, DEFAULT_PREVIEW_LEN};
use lucent_core::TextEncoderVariant;
use lucent_solver::{MultistepSolver, SolverConfig};
use lucent::EngineConfig;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Variant {
    Sd15,
    Sd21,
}

impl From<Variant> for TextEncoderVariant {
    fn from(variant: Variant) -> Self {
        match variant {
            Variant::Sd15 => TextEncoderVariant::Sd15,
            Variant::Sd21 => TextEncoderVariant::Sd21,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "lucent-inspect")]
#[command(version)]
#[command(about = "Inspect Lucent tensor archives and solver schedules", long_about = None)]
struct Args {
    /// Tensor archive to load
    archive: Option<String>,

    /// Engine configuration file (JSON)
    #[arg(short, long, conflicts_with = "archive")]
    config: Option<String>,

    /// Text encoder family of the archive
    #[arg(long, value_enum, default_value = "sd15")]
    variant: Variant,

    /// Leading values shown per tensor
    #[arg(long, default_value_t = DEFAULT_PREVIEW_LEN)]
    preview: usize,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,

    /// Print the solver timesteps for this step count
    #[arg(long)]
    timesteps: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let (repository, solver_config) = match (&args.config, &args.archive) {
        (Some(path), _) => {
            info!("Loading engine configuration from {}", path);
            let config = EngineConfig::from_json_file(path)?;
            (config.open_repository()?, config.resolved_solver_config()?)
        }
        (None, Some(path)) => {
            info!("Loading archive {}", path);
            (
                TensorRepository::open(path, args.variant.into())?,
                SolverConfig::default(),
            )
        }
        (None, None) => return Err("either an archive path or --config is required".into()),
    };

    let summary = repository.summary(args.preview)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{summary}");
    }

    if let Some(step_count) = args.timesteps {
        let mut solver = MultistepSolver::new(solver_config)?;
        solver.set_timesteps(step_count)?;
        println!("solver timesteps ({step_count}): {:?}", solver.timesteps());

        match repository.step_group(step_count)? {
            Some(group) if group.timesteps() == solver.timesteps() => {
                info!("Archive timesteps match the solver");
            }
            Some(group) => {
                warn!("Archive timesteps differ: {:?}", group.timesteps());
            }
            None => {
                let supported = repository.supported_step_counts()?;
                warn!(
                    "Archive has no embeddings for {} steps (supported: {:?})",
                    step_count, supported
                );
            }
        }
    }

    Ok(())
}
