//! Echo demo: a proxy and a target talking over an in-memory byte stream.
//!
//! Run with: cargo run --bin mojo-lite-echo -- [--config <file.json>] [message...]

use std::path::PathBuf;
use std::process;
use std::sync::{Arc, OnceLock};

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use mojo_lite::{
    BindingConfig, DecodeError, HandlerError, InterfaceProxy, InterfaceTarget, MojomStruct,
    SpecError, StructSpec, StructValue, Type, bridge_stream,
};

const ECHO_ORDINAL: u32 = 0;
const INTERFACE_VERSION: u32 = 1;

struct EchoParams {
    message: String,
}

struct EchoResponse {
    message: String,
    length: u32,
}

impl MojomStruct for EchoParams {
    fn spec() -> Result<Arc<StructSpec>, SpecError> {
        static SPEC: OnceLock<Result<Arc<StructSpec>, SpecError>> = OnceLock::new();
        SPEC.get_or_init(|| {
            StructSpec::builder("EchoParams", 8)
                .field("message", 0, 0, Type::String, false)
                .build()
        })
        .clone()
    }

    fn into_value(self) -> StructValue {
        StructValue::new().with("message", self.message)
    }

    fn from_value(mut value: StructValue) -> Result<Self, DecodeError> {
        Ok(Self {
            message: value.take_as("EchoParams", "message")?,
        })
    }
}

impl MojomStruct for EchoResponse {
    fn spec() -> Result<Arc<StructSpec>, SpecError> {
        static SPEC: OnceLock<Result<Arc<StructSpec>, SpecError>> = OnceLock::new();
        SPEC.get_or_init(|| {
            StructSpec::builder("EchoResponse", 16)
                .field("message", 0, 0, Type::String, false)
                .field("length", 8, 0, Type::Uint32, false)
                .build()
        })
        .clone()
    }

    fn into_value(self) -> StructValue {
        StructValue::new()
            .with("message", self.message)
            .with("length", self.length)
    }

    fn from_value(mut value: StructValue) -> Result<Self, DecodeError> {
        Ok(Self {
            message: value.take_as("EchoResponse", "message")?,
            length: value.take_as("EchoResponse", "length")?,
        })
    }
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("MOJO_LITE_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("mojo_lite={level},mojo_lite_echo={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_args(
    mut args: impl Iterator<Item = String>,
) -> Result<(Option<PathBuf>, Vec<String>), String> {
    let mut config = None;
    let mut messages = Vec::new();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            config = Some(args.next().map(PathBuf::from).ok_or("--config requires a value")?);
        } else {
            messages.push(arg);
        }
    }
    if messages.is_empty() {
        messages.push("hello".to_string());
    }
    Ok((config, messages))
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<BindingConfig> {
    let Some(path) = path else {
        return Ok(BindingConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    BindingConfig::from_json_str(&json)
        .with_context(|| format!("invalid config {}", path.display()))
}

async fn run(config: BindingConfig, messages: Vec<String>) -> anyhow::Result<()> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client_handle, client_bridge) = bridge_stream(client_io, &config);
    let (server_handle, server_bridge) = bridge_stream(server_io, &config);

    let target = InterfaceTarget::with_config(config.clone()).with_version(INTERFACE_VERSION);
    target.register_typed(ECHO_ORDINAL, |params: EchoParams| async move {
        if params.message.is_empty() {
            return Err(HandlerError::new("refusing to echo an empty message"));
        }
        let length = u32::try_from(params.message.len())
            .map_err(|_| HandlerError::new("message too long"))?;
        Ok(EchoResponse {
            message: params.message,
            length,
        })
    })?;
    target.bind_handle(server_handle);

    let proxy = InterfaceProxy::with_config(config);
    proxy.bind_handle(client_handle)?;

    let version = proxy.query_version().await?;
    tracing::info!(version, "Connected to echo target");

    for message in messages {
        let reply: EchoResponse = proxy
            .call_typed(ECHO_ORDINAL, EchoParams { message })
            .await?;
        tracing::info!(length = reply.length, "Echoed");
        println!("{}", reply.message);
    }
    proxy.flush().await?;

    drop(proxy);
    target.close();
    client_bridge.await?;
    server_bridge.await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();

    let (config_path, messages) = match parse_args(std::env::args().skip(1)) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!("Usage: mojo-lite-echo [--config <file.json>] [message...]");
            process::exit(2);
        }
    };

    let result = match load_config(config_path.as_ref()) {
        Ok(config) => run(config, messages).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        tracing::error!(error = %e, "Echo demo failed");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}
