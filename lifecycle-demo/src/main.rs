//! Demo service: an echo HTTP server, a ticker feeding an in-process consumer, and a
//! metrics/probe server, all stopped together by the lifecycle group.
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context as _;
use axum::routing::{get, post};
use axum::{Extension, Router};
use envconfig::Envconfig;
use futures::channel::mpsc;
use futures::SinkExt;
use lifecycle::{consume_until_stopped, probes, BoxError, Context, Group, HttpServer};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

mod config;
mod metrics;

use config::Config;

fn init_tracing(debug: bool) {
    let base_layer = fmt::layer().with_target(true).with_level(true);
    let log_layer = if debug {
        base_layer
            .with_ansi(true)
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    } else {
        base_layer
            .json()
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    };

    tracing_subscriber::registry().with(log_layer).init();
}

/// Sleeps unless shutdown starts first; the request context outlives the root context
/// by the grace period.
async fn slow(Extension(ctx): Extension<Context>) -> &'static str {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(5)) => "finished\n",
        _ = ctx.done() => "interrupted\n",
    }
}

fn app() -> Router {
    Router::new()
        .route("/echo", post(|body: String| async move { body }))
        .route("/slow", get(slow))
        .layer(axum::middleware::from_fn(metrics::track_metrics))
}

async fn tick(
    ctx: Context,
    interval: Duration,
    mut tx: mpsc::Sender<u64>,
) -> Result<(), BoxError> {
    let mut ticker = tokio::time::interval(interval);
    let mut n = 0;
    loop {
        tokio::select! {
            biased;
            _ = ctx.done() => return Ok(()),
            _ = ticker.tick() => {
                n += 1;
                // Consumer gone means the group is already stopping.
                if tx.send(n).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_tick(_ctx: Context, n: u64) -> Result<(), BoxError> {
    info!(tick = n, "handled tick");
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let recorder =
        metrics::setup_metrics_recorder().context("failed to install metrics recorder")?;

    let flush_duration = config.flush_duration.0;
    let group = Group::builder("lifecycle-demo")
        .with_config(&config.lifecycle)
        .with_bootstrap(|ctx: Context| async move {
            tokio::select! {
                _ = ctx.done() => Err::<(), BoxError>("bootstrap canceled".into()),
                _ = tokio::time::sleep(Duration::from_millis(50)) => {
                    info!("caches warmed");
                    Ok(())
                }
            }
        })
        .with_closer(move |ctx: Context| async move {
            info!(deadline = ?ctx.deadline(), "flushing buffers");
            tokio::time::sleep(flush_duration).await;
            info!("buffers flushed");
            Ok::<(), BoxError>(())
        })
        .build()
        .await?;

    let listener = TcpListener::bind(config.bind())
        .await
        .with_context(|| format!("could not bind {}", config.bind()))?;
    group.run_server(HttpServer::new(listener, app()));

    let metrics_listener = TcpListener::bind(&config.metrics_bind)
        .await
        .with_context(|| format!("could not bind {}", config.metrics_bind))?;
    let metrics_router = metrics::with_metrics_route(probes::router(group.readiness()), recorder);
    group.run_server(HttpServer::new(metrics_listener, metrics_router));

    let (tx, rx) = mpsc::channel(16);
    let interval = config.tick_interval.0;
    group.run(move |ctx| tick(ctx, interval, tx));
    group.run_consumer(move |consume, handle| {
        consume_until_stopped(consume, handle, rx, handle_tick)
    });

    info!(bind = %config.bind(), "service started");
    group.wait().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::init_from_env().expect("Invalid configuration:");
    init_tracing(config.debug);

    match run(config).await {
        Ok(()) => {
            info!("service stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "service stopped with errors");
            ExitCode::FAILURE
        }
    }
}
