use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use defidash_cache::Cache;
use defidash_core::{config::Environment, db, DashConfig};
use defidash_jobs::{install_panic_capture, JobRunner, Queue, Registry, Scheduler, Worker};
use tokio::{sync::watch, task::JoinError, task::JoinSet};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod app;
mod builtin;
mod cli;
mod http;
mod shutdown;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    // load config: --config > DEFIDASH_CONFIG env > ./defidash.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("DEFIDASH_CONFIG").ok());
    let (config, load_error) = match DashConfig::load(config_path.as_deref()) {
        Ok(config) => (config, None),
        Err(e) => (DashConfig::default(), Some(e)),
    };
    init_tracing(config.app.env);
    if let Some(e) = load_error {
        warn!("Config load failed ({}), using defaults", e);
    }

    install_panic_capture();

    // registration errors abort startup
    let mut builder = Registry::builder();
    builtin::register(&mut builder)?;
    let registry = Arc::new(builder.build()?);

    info!(path = %config.database.path, "opening SQLite database");
    let queue = Queue::new(db::open(&config.database)?)?;
    let cache = Cache::new(db::open(&config.database)?)?;
    let runner = JobRunner::new(Arc::clone(&registry), queue, cache);

    let job = cli::resolve_job(cli.job.as_deref(), config.app.env).to_string();
    if job == cli::START {
        return start(config, registry, runner).await;
    }

    let args = cli::parse_args(&cli.args);
    let outcome = runner.run_job(&job, args).await;
    if !outcome.is_success() {
        anyhow::bail!("job {job} {outcome}");
    }
    Ok(())
}

fn init_tracing(env: Environment) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "defidash=info,defidash_jobs=info,defidash_cache=info,tower_http=info".into());
    let fmt = tracing_subscriber::fmt().with_env_filter(filter);
    if env.is_production() {
        fmt.json().init();
    } else {
        fmt.init();
    }
}

/// Run the worker loop, the scheduler loop and the HTTP listener until a
/// shutdown signal arrives or a loop fails.
async fn start(config: DashConfig, registry: Arc<Registry>, runner: JobRunner) -> anyhow::Result<()> {
    // each loop gets its own connections, like a separate process would
    let worker = Worker::new(Queue::new(db::open(&config.database)?)?, runner.clone())
        .with_batch_size(config.jobs.batch_size)
        .with_idle_poll(Duration::from_millis(config.jobs.idle_poll_ms));
    let scheduler = Scheduler::new(
        db::open(&config.database)?,
        registry,
        Queue::new(db::open(&config.database)?)?,
    )?
    .with_tick(Duration::from_secs(config.jobs.scheduler_tick_secs.max(1)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut loops = JoinSet::new();
    let rx = shutdown_rx.clone();
    loops.spawn(async move { ("worker", worker.run(rx).await) });
    let rx = shutdown_rx.clone();
    loops.spawn(async move { ("scheduler", scheduler.run(rx).await) });

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let router = app::build_router(Arc::new(app::AppState::new(config, runner)));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("defidash listening on {}", addr);
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown::stopped(shutdown_rx))
            .await
    });

    let mut failure = tokio::select! {
        _ = shutdown::signal() => {
            info!("shutdown signal received");
            None
        }
        Some(joined) = loops.join_next() => loop_failure(joined),
    };

    // running batches and passes finish before the loops return
    let _ = shutdown_tx.send(true);
    while let Some(joined) = loops.join_next().await {
        if let Some(e) = loop_failure(joined) {
            failure.get_or_insert(e);
        }
    }
    server.await??;

    match failure {
        Some(e) => Err(e),
        None => {
            info!("defidash stopped");
            Ok(())
        }
    }
}

type LoopExit = (&'static str, defidash_jobs::Result<()>);

fn loop_failure(joined: Result<LoopExit, JoinError>) -> Option<anyhow::Error> {
    match joined {
        Ok((_, Ok(()))) => None,
        Ok((name, Err(e))) => {
            error!(task = name, error = %e, "background loop failed");
            Some(anyhow::Error::new(e).context(format!("{name} loop failed")))
        }
        Err(e) => {
            error!(error = %e, "background loop panicked");
            Some(e.into())
        }
    }
}
