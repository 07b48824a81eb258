use std::{path::PathBuf, str::FromStr, sync::Arc};

use clap::Parser;
use serde::Deserialize;

use bucket_guard::{
    cluster::{
        distribution::{Distribution, DistributionConfigBundle},
        state::ClusterStateBundle,
    },
    config::Config,
    drain::InMemoryOperationQueue,
    gate::ChangedOwnershipGate,
    link::{mock::RecordingSender, StorageLink},
    message::{SetSystemState, StorageCommand, StorageMessage},
    metrics::OwnershipMetrics,
    telemetry::{initialize_jaeger_subscriber, initialize_subscriber},
};

#[derive(Debug, Parser)]
#[command(name = "bucket-guard-replay")]
#[command(about = "Replays a cluster state scenario through the bucket ownership gate", long_about = None)]
struct Cli {
    #[arg(long)]
    config_path: PathBuf,
    #[arg(long)]
    scenario: PathBuf,
    #[arg(long, default_value = "false")]
    json_logs: bool,
    #[arg(short, long, default_value = "false")]
    tracing_jaeger: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct Scenario {
    distribution: Distribution,
    steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Step {
    /// A cluster state change sent through the chain
    SetState(String),
    SetDistribution(Distribution),
    /// An operation waiting in the persistence queue
    Enqueue(StorageCommand),
    /// An operation sent through the chain
    Command(StorageCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    if args.tracing_jaeger {
        initialize_jaeger_subscriber("http://localhost:4317/v1/traces")?;
    } else {
        initialize_subscriber(args.json_logs);
    }

    let config = Config::from_path(&args.config_path)?;
    let scenario: Scenario = serde_json::from_str(&std::fs::read_to_string(&args.scenario)?)?;

    let up = Arc::new(RecordingSender::new());
    let down = Arc::new(RecordingSender::new());
    let queue = Arc::new(InMemoryOperationQueue::new());
    let metrics = Arc::new(OwnershipMetrics::new());
    let gate = ChangedOwnershipGate::from_config(
        &config,
        Some(Arc::new(DistributionConfigBundle::from_default(
            scenario.distribution,
        ))),
        up.clone(),
        down.clone(),
        queue.clone(),
        metrics.clone(),
    )?;

    for (step_index, step) in scenario.steps.into_iter().enumerate() {
        match step {
            Step::SetState(state) => {
                let bundle = Arc::new(ClusterStateBundle::from_str(&state)?);
                let disposition = gate.handle_inbound(StorageMessage::SetSystemState(
                    SetSystemState {
                        id: step_index as u64,
                        bundle,
                    },
                ));
                gate.coordinator().sync().await?;
                println!(
                    "[{}] set_state '{}': {:?}, {} queued operations aborted",
                    step_index,
                    state,
                    disposition,
                    up.take_aborted_replies().len()
                );
            }
            Step::SetDistribution(distribution) => {
                gate.coordinator()
                    .on_distribution_changed(Arc::new(DistributionConfigBundle::from_default(
                        distribution,
                    )))?;
                gate.coordinator().sync().await?;
                println!(
                    "[{}] set_distribution: {} queued operations aborted",
                    step_index,
                    up.take_aborted_replies().len()
                );
            }
            Step::Enqueue(cmd) => {
                println!(
                    "[{}] enqueue {} {} to {} from distributor {}",
                    step_index, cmd.kind, cmd.id, cmd.bucket, cmd.source_index
                );
                queue.push(cmd);
            }
            Step::Command(cmd) => {
                let description = format!(
                    "{} {} to {} from distributor {}",
                    cmd.kind, cmd.id, cmd.bucket, cmd.source_index
                );
                let disposition = gate.handle_inbound(cmd.into());
                up.take();
                println!("[{}] command {}: {:?}", step_index, description, disposition);
            }
        }
    }

    gate.handle_close();
    gate.coordinator().join().await;
    println!(
        "{}",
        serde_json::to_string_pretty(&metrics.snapshot())?
    );

    Ok(())
}
