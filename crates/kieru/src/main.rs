use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kieru_server::store::{unix_now, PayloadKind};
use reqwest::{Client, Method, RequestBuilder};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "kieru", about = "Kieru: self-destructing secrets", version)]
struct Cli {
    /// Kieru server URL (default: http://localhost:8080 or $KIERU_SERVER)
    #[arg(long, env = "KIERU_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Bearer token identifying you to the server ($KIERU_TOKEN)
    #[arg(long, env = "KIERU_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Kieru HTTP server
    Serve {
        /// Port to listen on (default: $KIERU_PORT or 8080)
        #[arg(long, env = "KIERU_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $KIERU_HOST or 0.0.0.0)
        #[arg(long, env = "KIERU_HOST", default_value = "0.0.0.0")]
        host: String,
        /// Directory holding kieru.db (default: $KIERU_DATA_DIR or platform data dir)
        #[arg(long, env = "KIERU_DATA_DIR")]
        data_dir: Option<PathBuf>,
        /// Token verification endpoint ($KIERU_IDENTITY_URL)
        #[arg(long, env = "KIERU_IDENTITY_URL")]
        identity_url: Option<String>,
    },
    /// Create a secret from already-encrypted content
    Create {
        /// Display name
        name: String,
        /// Content, or omit and pass --file
        #[arg(conflicts_with = "file", required_unless_present = "file")]
        content: Option<String>,
        /// Read content from a file
        #[arg(long)]
        file: Option<PathBuf>,
        /// TEXT or IMAGE
        #[arg(long = "type", default_value = "TEXT", value_parser = parse_kind)]
        kind: PayloadKind,
        /// Password required to open the secret
        #[arg(long)]
        password: Option<String>,
        /// Number of views before the secret is gone
        #[arg(long, default_value = "1")]
        views: u32,
        /// Lifetime e.g. 1h, 30m, 7d (server default: 24h)
        #[arg(long)]
        ttl: Option<String>,
        /// Seconds the content stays on screen once opened
        #[arg(long)]
        view_time: Option<u32>,
    },
    /// Redeem one view of a secret and print its content
    Open {
        id: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Show a secret's status without spending a view
    Info { id: String },
    /// List your secrets
    List {
        #[arg(long, default_value = "0")]
        page: usize,
        #[arg(long, default_value = "20")]
        size: usize,
        /// Only secrets that can still be opened
        #[arg(long)]
        active: bool,
    },
    /// Show who opened one of your secrets
    Logs {
        id: String,
        #[arg(long, default_value = "0")]
        page: usize,
        #[arg(long, default_value = "20")]
        size: usize,
    },
    /// Set or replace the password on one of your secrets
    Password { id: String, password: String },
    /// Delete one of your secrets
    Delete { id: String },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("KIERU_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let api = Api::new(&cli.server, cli.token.clone());

    match cli.command {
        Commands::Serve {
            port,
            host,
            data_dir,
            identity_url,
        } => {
            let cfg = kieru_server::ServerConfig {
                host,
                port,
                data_dir,
                identity_url,
                ..Default::default()
            };
            kieru_server::run(cfg).await
        }

        Commands::Create {
            name,
            content,
            file,
            kind,
            password,
            views,
            ttl,
            view_time,
        } => {
            let content = match (content, file) {
                (Some(c), _) => c,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("read {}", path.display()))?,
                (None, None) => anyhow::bail!("pass content or --file"),
            };
            let expires_at = ttl
                .as_deref()
                .map(parse_duration)
                .transpose()?
                .map(|secs| unix_now() + secs as i64);
            let body = json!({
                "secretName": name,
                "content": content,
                "type": kind.as_str(),
                "password": password,
                "maxViews": views,
                "expiresAt": expires_at,
                "viewTimeSeconds": view_time,
            });
            cmd_create(&api, &body).await
        }

        Commands::Open { id, password } => cmd_open(&api, &id, password.as_deref()).await,

        Commands::Info { id } => cmd_info(&api, &id).await,

        Commands::List { page, size, active } => {
            api.require_token()?;
            cmd_list(&api, page, size, active).await
        }

        Commands::Logs { id, page, size } => {
            api.require_token()?;
            cmd_logs(&api, &id, page, size).await
        }

        Commands::Password { id, password } => {
            api.require_token()?;
            cmd_password(&api, &id, &password).await
        }

        Commands::Delete { id } => {
            api.require_token()?;
            cmd_delete(&api, &id).await
        }
    }
}

// ── HTTP client ───────────────────────────────────────────────────────────────

struct Api {
    client: Client,
    server: String,
    token: Option<String>,
}

impl Api {
    fn new(server: &str, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            server: server.trim_end_matches('/').to_owned(),
            token,
        }
    }

    fn require_token(&self) -> Result<()> {
        self.token
            .as_ref()
            .map(|_| ())
            .context("--token / KIERU_TOKEN is required for this command")
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self.client.request(method, format!("{}{path}", self.server));
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Send and decode a JSON body, turning error statuses into the server's message.
    async fn send(&self, req: RequestBuilder) -> Result<Value> {
        let resp = req.send().await.context("HTTP request failed")?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let json: Value = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        if !status.is_success() {
            let error = json["error"].as_str().unwrap_or("unknown error");
            anyhow::bail!("server returned {status}: {error}");
        }
        Ok(json)
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_create(api: &Api, body: &Value) -> Result<()> {
    let created = api
        .send(api.request(Method::POST, "/api/secrets").json(body))
        .await?;
    let id = created["id"].as_str().unwrap_or_default();
    println!("✓ created {id}");
    println!("  {}/api/secrets/{id}/access", api.server);
    if let Some(exp) = created["expiresAt"].as_i64() {
        println!("  expires in {}", remaining(exp));
    }
    Ok(())
}

async fn cmd_open(api: &Api, id: &str, password: Option<&str>) -> Result<()> {
    let path = format!("/api/secrets/{id}/access");
    let granted = api
        .send(
            api.request(Method::POST, &path)
                .json(&json!({ "password": password })),
        )
        .await?;
    println!("{}", granted["encryptedContent"].as_str().unwrap_or(""));
    eprintln!(
        "({} view(s) left, expires in {})",
        granted["viewsLeft"].as_u64().unwrap_or(0),
        remaining(granted["expiresAt"].as_i64().unwrap_or(0))
    );
    Ok(())
}

async fn cmd_info(api: &Api, id: &str) -> Result<()> {
    let path = format!("/api/secrets/{id}/validation");
    let s = api.send(api.request(Method::GET, &path)).await?;
    print_summary(&s);
    Ok(())
}

async fn cmd_list(api: &Api, page: usize, size: usize, active: bool) -> Result<()> {
    let path = format!("/api/dashboard/secrets?page={page}&size={size}&active={active}");
    let json = api.send(api.request(Method::GET, &path)).await?;
    let secrets = json["secrets"].as_array().cloned().unwrap_or_default();
    if secrets.is_empty() {
        println!("(no secrets)");
        return Ok(());
    }
    for s in &secrets {
        print_summary(s);
    }
    Ok(())
}

async fn cmd_logs(api: &Api, id: &str, page: usize, size: usize) -> Result<()> {
    let path = format!("/api/dashboard/secrets/{id}/logs?page={page}&size={size}");
    let json = api.send(api.request(Method::GET, &path)).await?;
    let logs = json["logs"].as_array().cloned().unwrap_or_default();
    if logs.is_empty() {
        println!("(no access yet)");
        return Ok(());
    }
    for log in &logs {
        let outcome = if log["wasSuccessful"].as_bool().unwrap_or(false) {
            "opened".to_owned()
        } else {
            format!("denied ({})", log["failureReason"].as_str().unwrap_or("?"))
        };
        println!(
            "  {} ago  {}  {}  {}",
            format_duration(unix_now().saturating_sub(log["accessedAt"].as_i64().unwrap_or(0)) as u64),
            log["ipAddress"].as_str().unwrap_or("?"),
            log["deviceType"].as_str().unwrap_or("unknown"),
            outcome
        );
    }
    Ok(())
}

async fn cmd_password(api: &Api, id: &str, password: &str) -> Result<()> {
    let path = format!("/api/secrets/{id}/password");
    api.send(
        api.request(Method::POST, &path)
            .json(&json!({ "password": password })),
    )
    .await?;
    println!("✓ password set on {id}");
    Ok(())
}

async fn cmd_delete(api: &Api, id: &str) -> Result<()> {
    let path = format!("/api/secrets/{id}");
    api.send(api.request(Method::DELETE, &path)).await?;
    println!("✓ deleted {id}");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn print_summary(s: &Value) {
    let state = if s["isActive"].as_bool().unwrap_or(false) {
        format!("expires in {}", remaining(s["expiresAt"].as_i64().unwrap_or(0)))
    } else {
        "gone".to_owned()
    };
    let lock = if s["isPasswordProtected"].as_bool().unwrap_or(false) {
        " 🔒"
    } else {
        ""
    };
    println!(
        "  {} {}{} | {}/{} views left | {}",
        s["id"].as_str().unwrap_or("?"),
        s["secretName"].as_str().unwrap_or(""),
        lock,
        s["viewsLeft"].as_u64().unwrap_or(0),
        s["maxViews"].as_u64().unwrap_or(0),
        state
    );
}

fn parse_kind(s: &str) -> Result<PayloadKind, String> {
    PayloadKind::parse(s).ok_or_else(|| format!("unknown content type: {s} (use TEXT or IMAGE)"))
}

fn remaining(expires_at: i64) -> String {
    let secs_left = expires_at - unix_now();
    if secs_left > 0 {
        format_duration(secs_left as u64)
    } else {
        "0s".to_owned()
    }
}

/// Parse human duration strings like "1h", "30m", "7d", "5s" into seconds.
fn parse_duration(s: &str) -> Result<u64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    Ok(d.as_secs())
}

fn format_duration(secs: u64) -> String {
    if secs >= 86400 {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}
