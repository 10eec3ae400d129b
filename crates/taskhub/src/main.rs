use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use taskhub::connection::{ConnectionFactory, LoopbackConnectionFactory};
use taskhub::event_bus::attach_log_observer;
use taskhub::protocol::{ConnectionState, EndpointType, TransportError, TransportEvent};
use taskhub::{
    ApiClient, Cancellable, Category, EventBus, GraphQLRequest, LifecycleState, ResultProducing, Settings,
    StreamProducing, SubscriptionListeners,
};

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser)]
#[command(name = "taskhub", version, about = "Drive taskhub subscriptions from the command line")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a scripted subscription against the in-memory transport
    Replay {
        /// JSON script describing the request and the transport events to emit
        #[arg(long)]
        script: PathBuf,

        /// Endpoint name; defaults to the only configured GraphQL endpoint
        #[arg(long, env = "TASKHUB_API")]
        api: Option<String>,

        /// Settings file; defaults to the layered config/ directory
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

// ============================================================================
// Replay script
// ============================================================================

#[derive(Debug, Deserialize)]
struct Script {
    document: String,
    #[serde(default)]
    variables: Option<Value>,
    #[serde(default)]
    decode_path: Option<String>,
    steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Step {
    Connection { state: ConnectionState },
    /// A JSON payload, sent as-is
    Data { payload: Value },
    /// Raw text, for payloads that are not valid JSON
    Raw { text: String },
    Failed { error: ScriptFailure },
    Sleep { millis: u64 },
    Cancel,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ScriptFailure {
    Subscription {
        id: String,
        #[serde(default)]
        payload: Option<Value>,
    },
    Unauthorized,
    Connection {
        message: String,
    },
    Other {
        message: String,
    },
}

impl From<ScriptFailure> for TransportError {
    fn from(failure: ScriptFailure) -> Self {
        match failure {
            ScriptFailure::Subscription { id, payload } => TransportError::Subscription { id, payload },
            ScriptFailure::Unauthorized => TransportError::Unauthorized,
            ScriptFailure::Connection { message } => TransportError::Connection { message },
            ScriptFailure::Other { message } => TransportError::Other { message },
        }
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Replay { script, api, config } => replay(script, api, config).await,
    }
}

async fn replay(script_path: PathBuf, api: Option<String>, config: Option<PathBuf>) -> anyhow::Result<()> {
    let settings = match &config {
        Some(path) => Settings::from_file(path),
        None => Settings::new(),
    }
    .context("failed to load settings")?;

    let raw = std::fs::read_to_string(&script_path)
        .with_context(|| format!("failed to read script {}", script_path.display()))?;
    let script: Script = serde_json::from_str(&raw).context("invalid replay script")?;

    let mut request = GraphQLRequest::<Value>::new(script.document);
    if let Some(variables) = script.variables {
        request = request.with_variables(variables);
    }
    if let Some(path) = script.decode_path {
        request = request.with_decode_path(path);
    }
    if let Some(api) = &api {
        request = request.with_api_name(api);
    }

    let endpoint = settings.endpoint(api.as_deref(), EndpointType::GraphQL)?.clone();
    let auth = endpoint.auth_context(None)?;

    // Warm the pool so the script can address the connection the subscription will share.
    let factory = Arc::new(LoopbackConnectionFactory::new());
    factory.get_or_create_connection(&endpoint, &auth).await?;
    let connection = factory
        .connection(&endpoint.name, auth.mode)
        .await
        .context("loopback connection was not pooled")?;

    tracing::info!(
        endpoint = %endpoint.name,
        auth_mode = auth.mode.as_str(),
        steps = script.steps.len(),
        "replaying subscription script"
    );

    let bus = EventBus::new();
    attach_log_observer(&bus, Category::Api);
    let client = ApiClient::new(bus.clone(), settings, factory.clone());

    let task = client.subscribe_with(
        request,
        SubscriptionListeners::default().on_completion(|outcome| match outcome {
            Ok(()) => tracing::info!("subscription completed"),
            Err(e) => tracing::warn!(error = %e, "subscription failed"),
        }),
    );
    let mut sequence = task.sequence().context("subscription sequence already taken")?;

    let consumer = tokio::spawn(async move {
        let mut observed = 0usize;
        while let Some(item) = sequence.next().await {
            observed += 1;
            match item {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => println!("unprintable event: {e}"),
                },
                Err(e) => println!("error: {e}"),
            }
        }
        observed
    });

    tokio::select! {
        _ = connection.wait_for_subscriptions(1) => {}
        _ = task.result() => {}
    }

    for step in script.steps {
        match step {
            Step::Connection { state } => connection.emit(TransportEvent::Connection(state)),
            Step::Data { payload } => connection.emit(TransportEvent::Data(serde_json::to_vec(&payload)?)),
            Step::Raw { text } => connection.emit(TransportEvent::Data(text.into_bytes())),
            Step::Failed { error } => connection.emit(TransportEvent::Failed(error.into())),
            Step::Sleep { millis } => tokio::time::sleep(Duration::from_millis(millis)).await,
            Step::Cancel => task.cancel(),
        }
    }

    if task.state() != LifecycleState::Terminated {
        tracing::info!("script ended with the subscription still open, cancelling");
        task.cancel();
    }

    let observed = consumer.await?;
    let outcome = task.result().await;
    bus.flush().await;

    match outcome {
        Ok(()) => println!("result: ok"),
        Err(e) => println!("result: {} ({})", e, e.as_label()),
    }
    tracing::info!(observed, "replay finished");

    Ok(())
}
