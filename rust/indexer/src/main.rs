//! Deterministic Sharded Index tool
//!
//! Builds the global index file for an epoch on the leader, verifies
//! persisted files, and prints the partition a rank or loader worker reads.
//!
//! # Usage
//!
//! ```bash
//! # Build and persist the order for epoch 3 of a 1M-sample dataset
//! dsi-indexer build --config sampler.toml --length 1000000 --epoch 3
//!
//! # Check a persisted file against its manifest
//! dsi-indexer verify --index /shared/run/global_indices
//!
//! # Show the first indices worker 1 of rank 2 reads
//! dsi-indexer inspect --config sampler.toml --length 1000000 --rank 2 --worker 1 --num-workers 4
//! ```

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dsi_core::config::SamplerConfig;
use dsi_core::index::{generate, IndexManifest, IndexPlan, IndexStore};
use dsi_core::partition::{partition, PartitionSpec, WorkerInfo};
use dsi_core::SamplerError;

type CliResult<T> = Result<T, Box<dyn Error>>;

/// Deterministic Sharded Index tool
#[derive(Parser, Debug)]
#[command(name = "dsi-indexer")]
#[command(about = "Build, verify and inspect persisted global index files")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate the order for an epoch and persist it with its manifest
    Build(BuildArgs),
    /// Validate an index file's size and checksum
    Verify(VerifyArgs),
    /// Print the indices of one partition
    Inspect(InspectArgs),
}

#[derive(Args, Debug)]
struct PlanArgs {
    /// Sampler configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of samples in the dataset
    #[arg(short, long)]
    length: usize,

    /// Epoch to build (defaults to sampling.epoch)
    #[arg(short, long)]
    epoch: Option<u64>,
}

#[derive(Args, Debug)]
struct BuildArgs {
    #[command(flatten)]
    plan: PlanArgs,

    /// Index file to write (defaults to index.index_file)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    /// Index file to check
    #[arg(short, long)]
    index: PathBuf,

    /// Required number of indices
    #[arg(long)]
    expected_total: Option<usize>,
}

#[derive(Args, Debug)]
struct InspectArgs {
    #[command(flatten)]
    plan: PlanArgs,

    /// Rank to inspect (defaults to distributed.rank)
    #[arg(short, long)]
    rank: Option<usize>,

    /// Loader worker id
    #[arg(short, long, requires = "num_workers")]
    worker: Option<usize>,

    /// Loader workers per rank
    #[arg(long, requires = "worker")]
    num_workers: Option<usize>,

    /// Maximum number of indices to print
    #[arg(long, default_value = "32")]
    limit: usize,
}

fn main() -> CliResult<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Command::Build(args) => {
            let manifest = build(&args)?;
            print!("{}", toml::to_string_pretty(&manifest)?);
        }
        Command::Verify(args) => {
            let report = verify(&args)?;
            println!("{report}");
        }
        Command::Inspect(args) => {
            let indices = inspect(&args)?;
            let line: Vec<String> = indices.iter().map(u32::to_string).collect();
            println!("{}", line.join(" "));
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> CliResult<SamplerConfig> {
    let config = match path {
        Some(path) => SamplerConfig::from_file(path)?,
        None => SamplerConfig::default(),
    }
    .with_env_overrides();
    config.validate()?;
    Ok(config)
}

fn resolve_plan(args: &PlanArgs) -> CliResult<(SamplerConfig, IndexPlan, u64)> {
    let config = load_config(args.config.as_ref())?;
    let env = config.distributed.resolve()?;
    let plan = IndexPlan {
        length: args.length,
        world_size: env.world_size,
        seed: config.sampling.seed,
        shuffle: config.sampling.shuffle,
        drop_last: config.sampling.drop_last,
    };
    let epoch = args.epoch.unwrap_or(config.sampling.epoch);
    Ok((config, plan, epoch))
}

fn build(args: &BuildArgs) -> CliResult<IndexManifest> {
    let (config, plan, epoch) = resolve_plan(&args.plan)?;

    let store = match &args.output {
        Some(path) => IndexStore::new(path),
        None => IndexStore::from_config(&config.index).ok_or_else(|| {
            SamplerError::config("no output given and index.index_file is not set")
        })?,
    };

    tracing::info!(
        length = plan.length,
        world_size = plan.world_size,
        epoch,
        path = %store.path().display(),
        "building global indices"
    );
    let indices = generate(&plan, epoch)?;
    Ok(store.persist(&indices)?)
}

fn verify(args: &VerifyArgs) -> CliResult<String> {
    let store = IndexStore::new(&args.index);

    let (view, manifest) = match store.read_manifest()? {
        Some(manifest) => {
            if let Some(expected) = args.expected_total {
                if expected != manifest.total_size {
                    return Err(SamplerError::storage(
                        &args.index,
                        format!(
                            "manifest records {} indices, expected {expected}",
                            manifest.total_size
                        ),
                    )
                    .into());
                }
            }
            (store.load_verified(&manifest)?, Some(manifest))
        }
        None => {
            tracing::warn!(path = %args.index.display(), "no manifest found, checking size only");
            (store.load(args.expected_total)?, None)
        }
    };

    let mut report = format!(
        "{}: {} indices, checksum {:#018x}",
        args.index.display(),
        view.len(),
        view.checksum()
    );
    if let Some(manifest) = manifest {
        report.push_str(&format!(
            ", epoch {}, world size {}, verified",
            manifest.epoch, manifest.world_size
        ));
    }
    Ok(report)
}

fn inspect(args: &InspectArgs) -> CliResult<Vec<u32>> {
    let (config, plan, epoch) = resolve_plan(&args.plan)?;
    let env = config.distributed.resolve()?;

    let worker = match (args.worker, args.num_workers) {
        (Some(id), Some(num_workers)) => Some(WorkerInfo::new(id, num_workers)),
        _ => None,
    };
    let spec = PartitionSpec {
        rank: args.rank.unwrap_or(env.rank),
        world_size: env.world_size,
        worker,
        device_batch_size: config.sampling.global_batch_size / env.world_size,
        start_index: if epoch == config.sampling.epoch {
            config.sampling.start_index
        } else {
            0
        },
    };

    // Prefer the persisted order when one exists for this epoch.
    let view = match IndexStore::from_config(&config.index) {
        Some(store) if store.read_manifest()?.is_some_and(|m| m.matches(&plan, epoch)) => {
            store.load_for(&plan, epoch)?
        }
        _ => generate(&plan, epoch)?.into_view(),
    };

    Ok(partition(&view, &spec)?.take(args.limit).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("sampler.toml");
        fs::write(&path, body).unwrap();
        path
    }

    const CONFIG: &str = r#"
        [sampling]
        global_batch_size = 8
        seed = 3
        shuffle = false

        [distributed]
        world_size = 2
        rank = 0
        local_rank = 0
    "#;

    #[test]
    fn test_build_then_verify() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, CONFIG);
        let output = dir.path().join("global_indices");

        let manifest = build(&BuildArgs {
            plan: PlanArgs {
                config: Some(config),
                length: 21,
                epoch: Some(2),
            },
            output: Some(output.clone()),
        })
        .unwrap();
        assert_eq!(manifest.total_size, 22);
        assert_eq!(manifest.epoch, 2);

        let report = verify(&VerifyArgs {
            index: output.clone(),
            expected_total: Some(22),
        })
        .unwrap();
        assert!(report.contains("22 indices"));
        assert!(report.contains("verified"));

        assert!(verify(&VerifyArgs {
            index: output,
            expected_total: Some(20),
        })
        .is_err());
    }

    #[test]
    fn test_build_requires_output() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, CONFIG);
        let result = build(&BuildArgs {
            plan: PlanArgs {
                config: Some(config),
                length: 8,
                epoch: None,
            },
            output: None,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_inspect_partition() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, CONFIG);

        // Identity order, rank 1 of 2, device batch 4, two workers.
        let indices = inspect(&InspectArgs {
            plan: PlanArgs {
                config: Some(config),
                length: 32,
                epoch: None,
            },
            rank: Some(1),
            worker: Some(1),
            num_workers: Some(2),
            limit: 6,
        })
        .unwrap();
        assert_eq!(indices, vec![9, 11, 13, 15, 25, 27]);
    }
}
