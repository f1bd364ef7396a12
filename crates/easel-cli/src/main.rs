mod server;

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use easel_contracts::requests::ImageParams;
use easel_engine::config::{EngineConfig, GeminiConfig, DEFAULT_GEMINI_API_BASE, DEFAULT_GEMINI_MODEL};
use easel_engine::resolver::RequestContext;
use easel_engine::AssetEngine;
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "easel", version, about = "Cached image generation and proxy service")]
struct Cli {
    #[command(flatten)]
    engine: EngineArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Serve(ServeArgs),
    Fetch(FetchArgs),
    Mask {
        #[command(subcommand)]
        command: MaskCommand,
    },
    Credentials,
}

#[derive(Debug, Subcommand)]
enum MaskCommand {
    Get {
        #[arg(long)]
        target: String,
    },
    Set {
        #[arg(long)]
        target: String,
        #[arg(long)]
        settings: String,
    },
}

#[derive(Args)]
struct EngineArgs {
    #[arg(long, global = true, env = "EASEL_ASSET_ROOT", default_value = ".")]
    asset_root: PathBuf,
    #[arg(long, global = true, env = "EASEL_CACHE_DIR", default_value = "img/gemini")]
    cache_dir: PathBuf,
    #[arg(long, global = true, env = "EASEL_PUBLIC_BASE_URL")]
    public_base_url: Option<String>,
    #[arg(long, global = true, env = "EASEL_MOUNT_PATH", default_value = "/")]
    mount_path: String,
    #[arg(long, global = true, env = "GEMINI_API_KEY", hide_env_values = true)]
    gemini_api_key: Option<String>,
    #[arg(long, global = true, env = "GEMINI_API_BASE", default_value = DEFAULT_GEMINI_API_BASE)]
    gemini_api_base: String,
    #[arg(long, global = true, env = "GEMINI_MODEL", default_value = DEFAULT_GEMINI_MODEL)]
    gemini_model: String,
    #[arg(long, global = true, env = "GEMINI_TIMEOUT_SECS", default_value_t = 120)]
    gemini_timeout_secs: u64,
    #[arg(long, global = true, env = "UNSPLASH_CLIENT_ID", hide_env_values = true)]
    proxy_client_id: Option<String>,
    #[arg(long, global = true, env = "EASEL_CONNECT_TIMEOUT_SECS", default_value_t = 5)]
    connect_timeout_secs: u64,
    #[arg(long, global = true, env = "EASEL_FETCH_TIMEOUT_SECS", default_value_t = 25)]
    fetch_timeout_secs: u64,
    #[arg(long, global = true, env = "EASEL_INTERNAL_TIMEOUT_SECS", default_value_t = 150)]
    internal_timeout_secs: u64,
    #[arg(long, global = true, env = "EASEL_MAX_FORWARD_DEPTH", default_value_t = 4)]
    max_forward_depth: u32,
    #[arg(long, global = true, env = "EASEL_THUMBNAIL_MAX_WIDTH", default_value_t = 256)]
    thumbnail_max_width: u32,
}

impl EngineArgs {
    fn into_config(self, bind: Option<SocketAddr>) -> EngineConfig {
        let defaults = EngineConfig::default();
        let public_base_url = self
            .public_base_url
            .filter(|value| !value.trim().is_empty())
            .or_else(|| bind.map(|addr| format!("http://{addr}")))
            .unwrap_or(defaults.public_base_url.clone());
        EngineConfig {
            asset_root: self.asset_root,
            cache_dir: self.cache_dir,
            public_base_url,
            mount_path: self.mount_path,
            gemini: GeminiConfig {
                api_key: self.gemini_api_key.filter(|value| !value.trim().is_empty()),
                api_base: self.gemini_api_base,
                model: self.gemini_model,
                connect_timeout_secs: self.connect_timeout_secs,
                timeout_secs: self.gemini_timeout_secs,
            },
            proxy_client_id: self.proxy_client_id,
            connect_timeout_secs: self.connect_timeout_secs,
            fetch_timeout_secs: self.fetch_timeout_secs,
            internal_timeout_secs: self.internal_timeout_secs,
            max_forward_depth: self.max_forward_depth,
            thumbnail_max_width: self.thumbnail_max_width,
            ..defaults
        }
    }
}

impl std::fmt::Debug for EngineArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redacted = |value: &Option<String>| value.as_ref().map(|_| "<redacted>");
        f.debug_struct("EngineArgs")
            .field("asset_root", &self.asset_root)
            .field("cache_dir", &self.cache_dir)
            .field("public_base_url", &self.public_base_url)
            .field("mount_path", &self.mount_path)
            .field("gemini_api_key", &redacted(&self.gemini_api_key))
            .field("gemini_api_base", &self.gemini_api_base)
            .field("gemini_model", &self.gemini_model)
            .field("gemini_timeout_secs", &self.gemini_timeout_secs)
            .field("proxy_client_id", &redacted(&self.proxy_client_id))
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .field("internal_timeout_secs", &self.internal_timeout_secs)
            .field("max_forward_depth", &self.max_forward_depth)
            .field("thumbnail_max_width", &self.thumbnail_max_width)
            .finish()
    }
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long, env = "EASEL_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,
}

#[derive(Debug, Args)]
struct FetchArgs {
    /// `gen://<prompt>` or an `http(s)://` image URL.
    #[arg(long)]
    url: String,
    #[arg(long)]
    pose: Option<String>,
    #[arg(long)]
    ref_background: Option<String>,
    #[arg(long)]
    ref_pose: Option<String>,
    #[arg(long)]
    ref_second: Option<String>,
    #[arg(long)]
    ref_third: Option<String>,
    #[arg(long)]
    kind: Option<String>,
    #[arg(long)]
    aspect: Option<String>,
    #[arg(long)]
    out: PathBuf,
}

impl FetchArgs {
    fn params(&self) -> ImageParams {
        let optional = [
            ("pose", &self.pose),
            ("ref_background", &self.ref_background),
            ("ref_pose", &self.ref_pose),
            ("ref_second", &self.ref_second),
            ("ref_third", &self.ref_third),
            ("kind", &self.kind),
            ("aspect", &self.aspect),
        ];
        let mut params = ImageParams::from_pairs([("url", self.url.as_str())]);
        for (key, value) in optional {
            if let Some(value) = value {
                params.set(key, value.as_str());
            }
        }
        params
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("easel error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    match cli.command {
        Command::Serve(args) => {
            let config = cli.engine.into_config(Some(args.bind));
            serve(config, args.bind)
        }
        Command::Fetch(args) => run_fetch(cli.engine.into_config(None), args),
        Command::Mask { command } => run_mask(cli.engine.into_config(None), command),
        Command::Credentials => {
            let engine = AssetEngine::new(cli.engine.into_config(None))?;
            print_json(&json!({ "configured": engine.credentials_configured(None) }))
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "easel=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// The engine owns blocking HTTP clients, so it is built and dropped outside
/// the async runtime.
fn serve(config: EngineConfig, bind: SocketAddr) -> Result<()> {
    let engine = Arc::new(AssetEngine::new(config)?);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let app = server::router(engine.clone());
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .with_context(|| format!("failed to bind {bind}"))?;
        tracing::info!("easel listening on http://{bind}");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("server terminated")
    })?;
    drop(runtime);
    drop(engine);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

fn run_fetch(config: EngineConfig, args: FetchArgs) -> Result<()> {
    let engine = AssetEngine::new(config)?;
    let reply = engine
        .fetch(&args.params(), &RequestContext::default())
        .with_context(|| format!("failed to fetch {}", args.url))?;
    if let Some(parent) = args.out.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&args.out, &reply.bytes)
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    print_json(&json!({
        "out": args.out.display().to_string(),
        "contentType": reply.content_type,
        "origin": format!("{:?}", reply.origin),
        "bytes": reply.bytes.len(),
    }))
}

fn run_mask(config: EngineConfig, command: MaskCommand) -> Result<()> {
    let engine = AssetEngine::new(config)?;
    match command {
        MaskCommand::Get { target } => {
            print_json(&serde_json::to_value(engine.read_mask_settings(&target))?)
        }
        MaskCommand::Set { target, settings } => {
            let settings: Value =
                serde_json::from_str(&settings).context("--settings must be a JSON object")?;
            match engine.write_mask_settings(&target, &settings) {
                Ok(path) => print_json(&json!({ "success": true, "path": path.display().to_string() })),
                Err(err) => {
                    print_json(&json!({ "success": false, "error": err.to_string() }))?;
                    bail!("mask settings not written: {err}");
                }
            }
        }
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Command};

    #[test]
    fn fetch_args_become_image_params() {
        let cli = Cli::parse_from([
            "easel",
            "fetch",
            "--url",
            "gen://starry night",
            "--kind",
            "object",
            "--aspect",
            "1:1",
            "--out",
            "out.png",
        ]);
        let Command::Fetch(args) = cli.command else {
            panic!("expected fetch");
        };
        let params = args.params();
        assert_eq!(params.get("url"), Some("gen://starry night"));
        assert_eq!(params.get("kind"), Some("object"));
        assert_eq!(params.get("aspect"), Some("1:1"));
        assert_eq!(params.get("pose"), None);
    }

    #[test]
    fn debug_output_hides_secrets() {
        let cli = Cli::parse_from([
            "easel",
            "--gemini-api-key",
            "secret-value",
            "--proxy-client-id",
            "client-secret",
            "--connect-timeout-secs",
            "3",
            "credentials",
        ]);
        let rendered = format!("{cli:?}");
        assert!(!rendered.contains("secret-value"));
        assert!(!rendered.contains("client-secret"));
        assert!(rendered.contains("<redacted>"));

        let config = cli.engine.into_config(None);
        assert_eq!(config.gemini.connect_timeout_secs, 3);
        assert_eq!(config.gemini.api_key.as_deref(), Some("secret-value"));
    }

    #[test]
    fn serve_bind_feeds_public_base_url() {
        let cli = Cli::parse_from(["easel", "serve", "--bind", "127.0.0.1:9191", "--mount-path", "/studio"]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = cli.engine.into_config(Some(args.bind));
        if std::env::var_os("EASEL_PUBLIC_BASE_URL").is_none() {
            assert_eq!(config.public_base_url, "http://127.0.0.1:9191");
        }
        assert_eq!(config.routes().mount_path, "/studio/");
    }
}
