//! Sample service exposing a few controllers over HTTP and an in-process
//! broker.
//!
//! ```text
//! echo-server --config config.json --env local --port 4000
//! ```
//!
//! Routes: `POST /echo` (returns its payload), `POST /plus` (`{a, b}` to
//! `{result}`), `POST /greet` (emits `<cluster>:greetings:sent` when a queue
//! is configured). A broker controller on `*:greetings:*` logs every
//! greeting it receives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use meshkit_core::{FieldRule, ObjectSchema};
use meshkit_server::bus::MemoryBroker;
use meshkit_server::{
    logging, shutdown_signal, App, AppConfig, Controller, ControllerRegistry, Params, Settings,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "echo-server")]
#[command(version, about = "meshkit sample service", long_about = None)]
struct Args {
    /// JSON settings file
    #[arg(short, long, env = "MESHKIT_CONFIG")]
    config: Option<PathBuf>,

    /// Environment tag used to resolve other services
    #[arg(long, env = "MESHKIT_ENV")]
    env: Option<String>,

    /// Interface to bind
    #[arg(long, env = "MESHKIT_HOST")]
    host: Option<String>,

    /// Port to bind (0 picks a free port)
    #[arg(short, long, env = "MESHKIT_PORT")]
    port: Option<u16>,
}

fn load_config(args: Args) -> anyhow::Result<AppConfig> {
    let mut settings = match &args.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };
    if let Some(env) = args.env {
        settings.set("env", env);
    }
    if let Some(host) = args.host {
        settings.set("http.host", host);
    }
    if let Some(port) = args.port {
        settings.set("http.port", port);
    }
    Ok(AppConfig::from_settings(&settings)?)
}

#[derive(Deserialize)]
struct Operands {
    a: f64,
    b: f64,
}

fn registry(config: &AppConfig) -> anyhow::Result<ControllerRegistry> {
    let mut registry = ControllerRegistry::new();

    registry.register(
        Controller::on(["/echo"], |params: Params| async move { Ok(params.data) }).build()?,
    )?;

    registry.register(
        Controller::on(["/plus"], |params: Params| async move {
            let Operands { a, b } = params.parse()?;
            Ok(json!({ "result": a + b }))
        })
        .validator(
            ObjectSchema::new()
                .field("a", FieldRule::number().required())
                .field("b", FieldRule::number().required()),
        )
        .build()?,
    )?;

    let clusters: Vec<String> = config
        .queue
        .as_ref()
        .map(|queue| queue.keys().cloned().collect())
        .unwrap_or_default();
    registry.register(
        Controller::on(["/greet"], move |params: Params| {
            let clusters = clusters.clone();
            async move {
                for cluster in &clusters {
                    params
                        .emit
                        .emit(&format!("{cluster}:greetings:sent"), params.data.clone())?;
                }
                Ok(json!({ "emitted": clusters.len() }))
            }
        })
        .validator(ObjectSchema::new().field("name", FieldRule::string().required()))
        .build()?,
    )?;

    registry.register(
        Controller::on(["*:greetings:*"], |params: Params| async move {
            info!(
                from = %params.meta.service_id,
                trace_id = %params.meta.trace_id(),
                name = %params.data["name"],
                "greeting received"
            );
            Ok(Value::Null)
        })
        .build()?,
    )?;

    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config(Args::parse())?;
    logging::init(&config.logging)?;

    let registry = registry(&config)?;
    let app = App::new(config, registry).with_broker(Arc::new(MemoryBroker::new()));
    let server = app.bind().await?;
    info!(addr = %server.local_addr(), "echo-server listening");

    server.run(shutdown_signal()).await
}
