use anyhow::{Context, Result};
use arcgrid_bus::{ChannelRegistry, FileRef, InMemoryTransport};
use arcgrid_repl::checksum::{digest, read_records};
use arcgrid_repl::client::Replica;
use arcgrid_repl::consistency::{sweep, Authority, SweepFinding};
use arcgrid_repl::coordinator::GridCoordinator;
use arcgrid_repl::sim::SimulatedPillar;
use arcgrid_repl::GridConfig;
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "arcgrid")]
#[command(about = "Archive grid replica coordination", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Validate a grid configuration and print its channels and policies.
    CheckConfig {
        #[arg(short, long, env = "ARCGRID_CONFIG")]
        config: PathBuf,
    },
    /// Compare two sorted checksum dumps. Exits non-zero on any difference.
    Audit {
        #[arg(long)]
        authoritative: PathBuf,
        #[arg(long)]
        reported: PathBuf,
    },
    /// Store and verify a file against simulated replicas in this process.
    DryRun {
        #[arg(short, long, env = "ARCGRID_CONFIG")]
        config: PathBuf,
        #[arg(long)]
        collection: Option<String>,
        file: PathBuf,
    },
}

impl Cli {
    /// Run the command. Returns false when the grid is not clean.
    pub async fn run(self) -> Result<bool> {
        match self.command {
            Command::CheckConfig { ref config } => check_config(config),
            Command::Audit {
                ref authoritative,
                ref reported,
            } => audit(authoritative, reported),
            Command::DryRun {
                ref config,
                ref collection,
                ref file,
            } => dry_run(config, collection.as_deref(), file).await,
        }
    }
}

fn load(path: &Path) -> Result<GridConfig> {
    let config = GridConfig::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn check_config(path: &Path) -> Result<bool> {
    let config = load(path)?;
    let channels = ChannelRegistry::new(config.environment.clone());
    println!("environment: {}", config.environment);
    println!("reply timeout: {}ms", config.reply_timeout_ms);
    println!("correction attempts: {}", config.max_correction_attempts);
    println!();
    println!("{:<16} {:<4} {}", "REPLICA", "KIND", "CHANNELS");
    for r in &config.replicas {
        println!(
            "{:<16} {:<4} {} {} {}",
            r.id,
            r.kind.code(),
            channels.all(r.kind, &r.id),
            channels.any(r.kind, &r.id),
            channels.monitor(&r.id)
        );
    }
    println!();
    println!("{:<16} {:<8} {:<12} {}", "COLLECTION", "PILLARS", "MAX FAILURES", "IDS");
    for c in &config.collections {
        let policy = config.policy(&c.id)?;
        let ids: Vec<&str> = policy.pillar_ids().iter().map(|p| p.as_str()).collect();
        println!(
            "{:<16} {:<8} {:<12} {}",
            c.id,
            policy.required(),
            policy.max_failures(),
            ids.join(",")
        );
    }
    Ok(true)
}

fn audit(authoritative: &Path, reported: &Path) -> Result<bool> {
    let open = |path: &Path| -> Result<BufReader<File>> {
        Ok(BufReader::new(
            File::open(path).with_context(|| format!("opening {}", path.display()))?,
        ))
    };
    let left = read_records(open(authoritative)?);
    let right = read_records(open(reported)?);

    let mut differences = 0usize;
    for finding in sweep(left, right) {
        match finding? {
            SweepFinding::Missing { filename, expected } => {
                println!("MISSING    {} {}", filename, expected)
            }
            SweepFinding::Unexpected { filename, reported } => {
                println!("UNEXPECTED {} {}", filename, reported)
            }
            SweepFinding::Mismatch {
                filename,
                expected,
                reported,
            } => println!("MISMATCH   {} expected {} got {}", filename, expected, reported),
        }
        differences += 1;
    }
    tracing::info!(differences, "audit finished");
    Ok(differences == 0)
}

async fn dry_run(path: &Path, collection: Option<&str>, file: &Path) -> Result<bool> {
    let config = load(path)?;
    let content = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("file has no name")?;
    let timeout = config.reply_timeout();
    let collections: Vec<String> = match collection {
        Some(c) => vec![c.to_string()],
        None => config.collections.iter().map(|c| c.id.clone()).collect(),
    };

    let grid = GridCoordinator::new(config.clone(), Arc::new(InMemoryTransport::new()))?;
    let ctx = grid.context().clone();
    let mut pillars = Vec::with_capacity(config.replicas.len());
    for r in &config.replicas {
        let replica = Replica::new(r.id.clone(), r.kind, &ctx.channels);
        pillars.push(SimulatedPillar::start(replica, ctx.clone())?);
    }

    let mut clean = true;
    for collection in &collections {
        let report = grid
            .store(FileRef::new(name.clone(), content.clone()), collection, timeout)
            .await?;
        println!("{}: store {:?}", collection, report.verdict);
        clean &= report.verdict.is_accept();

        let verified = grid
            .verify_file(
                &name,
                collection,
                Authority::Reference(digest(&content)),
                None,
                timeout,
            )
            .await?;
        println!(
            "{}: verify {:?} {}",
            collection, verified.verdict, verified.state
        );
        clean &= verified.verdict.is_accept() && verified.divergent.is_empty();
    }

    for pillar in &pillars {
        pillar.stop()?;
    }
    grid.close()?;
    Ok(clean)
}
