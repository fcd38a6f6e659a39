//! Email Worker Service (RabbitMQ)
//!
//! Consumes `email` jobs from a RabbitMQ queue, or publishes one.
//!
//! ## Architecture
//!
//! ```text
//! email-worker publish ──▶ TracedBroker ──▶ RabbitMQ (email_queue)
//!                                                 │ traceparent header
//!                                                 ▼
//! email-worker consume ◀── JobProcessor ◀── TracedBroker
//!        │
//!        ▼
//!   EmailHandler
//! ```
//!
//! ## Features
//!
//! - Trace context carried from publisher to handler through AMQP headers
//! - Manual ack/nack with per-handler requeue policy
//! - Graceful shutdown on SIGINT / SIGTERM
//! - Prometheus metrics on `METRICS_PORT`

pub mod config;
pub mod handler;

use amqp_worker::AmqpClient;
use clap::{Parser, Subcommand};
use config::WorkerConfig;
use core_config::telemetry::init_tracer_provider;
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use handler::{EmailHandler, EmailPayload, EMAIL_JOB_TYPE};
use messaging::{BrokerClient, JobProcessor, MessageBroker, Telemetry, TracedBroker};
use opentelemetry::trace::{SpanKind, TraceContextExt};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

pub const DEFAULT_QUEUE: &str = "email_queue";

#[derive(Parser, Debug)]
#[command(name = "email-worker")]
#[command(about = "Publish and process email jobs over RabbitMQ")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process email jobs until interrupted
    Consume {
        /// Queue to consume from
        #[arg(short, long, default_value = DEFAULT_QUEUE)]
        queue: String,
    },

    /// Submit one email job and print its id and status as JSON
    Publish {
        /// Recipient address
        #[arg(long, default_value = "admin@example.com")]
        to: String,

        #[arg(long, default_value = "test subject")]
        subject: String,

        #[arg(long, default_value = "test body")]
        body: String,

        /// Queue to publish to
        #[arg(short, long, default_value = DEFAULT_QUEUE)]
        queue: String,
    },
}

/// Run the worker
///
/// Sets up logging, the tracer provider and the RabbitMQ connection, runs
/// the requested command, then closes the connection and flushes the
/// tracer provider.
pub async fn run(cli: Cli) -> Result<()> {
    install_color_eyre();
    let environment = Environment::from_env();
    init_tracing(&environment);

    let config = WorkerConfig::from_env().wrap_err("Failed to load configuration")?;
    let provider = init_tracer_provider(&config.telemetry);
    let telemetry = Telemetry::from_provider(&provider);

    let client = AmqpClient::connect(&config.amqp)
        .await
        .wrap_err_with(|| format!("Failed to connect to RabbitMQ at {}", config.amqp.redacted_url()))?;
    let broker = Arc::new(TracedBroker::new(client, telemetry));

    let result = run_command(cli.command, &broker, &config).await;
    teardown(broker.as_ref(), &provider).await;
    result
}

/// Run one CLI command against an open broker.
pub async fn run_command<C: BrokerClient>(
    command: Commands,
    broker: &Arc<TracedBroker<C>>,
    config: &WorkerConfig,
) -> Result<()> {
    match command {
        Commands::Consume { queue } => {
            init_metrics(config.metrics_port)?;
            consume(Arc::clone(broker), config, &queue, shutdown_signal()).await
        }
        Commands::Publish {
            to,
            subject,
            body,
            queue,
        } => {
            let email = EmailPayload { to, subject, body };
            let response = publish(broker, &queue, email).await?;
            println!("{}", response);
            Ok(())
        }
    }
}

/// Close the broker connection and flush spans. Runs whatever the command
/// returned; failures here are only logged.
pub async fn teardown<B: MessageBroker>(broker: &B, provider: &SdkTracerProvider) {
    if let Err(e) = broker.close().await {
        warn!(error = %e, "Failed to close RabbitMQ connection");
    }
    if let Err(e) = provider.shutdown() {
        warn!(error = ?e, "Failed to shut down tracer provider");
    }
}

/// Process email jobs from `queue` until `shutdown` resolves.
pub async fn consume<B, S>(broker: Arc<B>, config: &WorkerConfig, queue: &str, shutdown: S) -> Result<()>
where
    B: MessageBroker,
    S: Future<Output = ()>,
{
    let processor = JobProcessor::new(broker).with_config(config.consumer.clone());
    processor
        .register_handler_with_policy(
            EMAIL_JOB_TYPE,
            EmailHandler::new(config.send_delay),
            config.requeue_policy(),
        )
        .wrap_err("Failed to register email handler")?;

    processor
        .start_consumer(&Context::new(), queue)
        .await
        .wrap_err_with(|| format!("Failed to start consumer for {}", queue))?;
    info!(
        queue,
        workers = config.consumer.workers,
        policy = %config.requeue_policy(),
        "Email worker running"
    );

    shutdown.await;
    info!("Shutting down email worker");
    processor.shutdown().await;
    Ok(())
}

/// Publish one email job to `queue`, declaring the queue first.
///
/// Returns `{"job_id": ..., "status": "pending"}`.
pub async fn publish<C: BrokerClient>(
    broker: &Arc<TracedBroker<C>>,
    queue: &str,
    email: EmailPayload,
) -> Result<serde_json::Value> {
    broker
        .client()
        .declare_queue(queue)
        .await
        .wrap_err_with(|| format!("Failed to declare queue {}", queue))?;

    let cx = broker.telemetry().start_span(
        "send-email",
        SpanKind::Client,
        &Context::new(),
        vec![KeyValue::new("email.to", email.to.clone())],
    );

    let processor = JobProcessor::new(Arc::clone(broker));
    let payload = serde_json::to_value(&email).wrap_err("Failed to encode email payload")?;
    let published = processor.publish_job(&cx, queue, EMAIL_JOB_TYPE, payload).await;
    cx.span().end();

    let job = published.wrap_err("Failed to publish email job")?;
    info!(job_id = %job.id, queue, "Email job submitted");
    Ok(serde_json::json!({
        "job_id": job.id,
        "status": job.status,
    }))
}

/// Install the Prometheus recorder with its scrape endpoint.
fn init_metrics(port: u16) -> Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .wrap_err("Failed to install Prometheus exporter")?;
    info!(%addr, "Metrics endpoint listening");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating shutdown..."),
    }
}
