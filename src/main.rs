mod cli;
mod config;
mod heartbeat;
mod http;
mod record;
mod serial;
mod store;
mod sweeper;
mod sync;
mod transmit;

use crate::cli::{Cli, Commands};
use crate::config::Config;
use crate::store::RecordStore;
use crate::sync::{spawn_mark_workers, SyncLoop, SyncMarker, SyncStats};
use crate::transmit::Transmitter;
use anyhow::{anyhow, Result};
use clap::Parser;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;

type TaskSet = JoinSet<(&'static str, Result<()>)>;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,serial_forwarder=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing()?;
    let config = Config::from_env()?;

    let store = RecordStore::connect(&config.database_url).await?;
    let result = match cli.command() {
        Commands::Run => {
            let mut tasks = TaskSet::new();
            spawn_reader(&mut tasks, &config, &store);
            spawn_producer(&mut tasks, &config, &store)?;
            supervise(tasks).await
        }
        Commands::Reader => {
            let mut tasks = TaskSet::new();
            spawn_reader(&mut tasks, &config, &store);
            supervise(tasks).await
        }
        Commands::Producer => {
            let mut tasks = TaskSet::new();
            spawn_producer(&mut tasks, &config, &store)?;
            supervise(tasks).await
        }
        Commands::Sweep => sweeper::sweep(&store).await.map(|_| ()),
        Commands::Status => print_status(&store).await,
    };
    store.close().await;
    result
}

fn spawn_named<F>(tasks: &mut TaskSet, name: &'static str, task: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tasks.spawn(async move { (name, task.await) });
}

fn spawn_reader(tasks: &mut TaskSet, config: &Config, store: &RecordStore) {
    spawn_named(
        tasks,
        "serial-reader",
        serial::run_reader(config.clone(), store.clone()),
    );
}

fn spawn_producer(tasks: &mut TaskSet, config: &Config, store: &RecordStore) -> Result<()> {
    let target = config.producer_target()?;
    let transmitter = Transmitter::new(config.http_timeout)?;
    let stats = Arc::new(SyncStats::new());

    let marker = if config.mark_workers > 0 {
        let (marker, handles) =
            spawn_mark_workers(store.clone(), config.mark_workers, config.mark_queue);
        for handle in handles {
            spawn_named(tasks, "mark-worker", async move {
                match handle.await {
                    Ok(result) => result,
                    Err(err) => Err(anyhow!(err).context("mark worker panicked")),
                }
            });
        }
        marker
    } else {
        SyncMarker::Inline(store.clone())
    };

    let hostname = target.hostname.clone();
    let sync_loop = SyncLoop::new(
        store.clone(),
        transmitter.clone(),
        marker,
        stats.clone(),
        target,
        config.batch_size,
    );
    spawn_named(tasks, "sync", sync_loop.run(config.poll_interval));
    spawn_named(
        tasks,
        "sweeper",
        sweeper::run(store.clone(), config.sweep_interval),
    );
    spawn_named(
        tasks,
        "heartbeat",
        heartbeat::run_optional(
            transmitter,
            config.api_url_ping.clone(),
            hostname,
            stats.clone(),
            config.ping_interval,
        ),
    );

    if let Some(bind) = config.http_bind.clone() {
        let state = http::HttpState {
            store: store.clone(),
            stats,
        };
        spawn_named(tasks, "status-http", http::serve(bind, state));
    }
    Ok(())
}

/// Waits for ctrl-c or the first task failure. Tasks that finish cleanly are
/// allowed to go away.
async fn supervise(mut tasks: TaskSet) -> Result<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                tasks.abort_all();
                return Ok(());
            }
            joined = tasks.join_next() => match joined {
                None => return Ok(()),
                Some(Ok((name, Ok(())))) => {
                    tracing::info!(task = name, "task finished");
                }
                Some(Ok((name, Err(err)))) => {
                    tracing::error!(task = name, error = %format!("{err:#}"), "task failed");
                    tasks.abort_all();
                    return Err(err.context(format!("{name} failed")));
                }
                Some(Err(err)) => {
                    tasks.abort_all();
                    return Err(anyhow!(err).context("task panicked"));
                }
            }
        }
    }
}

async fn print_status(store: &RecordStore) -> Result<()> {
    let counts = store.counts().await?;
    println!("{}", serde_json::to_string_pretty(&counts)?);
    Ok(())
}
