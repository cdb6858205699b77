use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "presence", about = "Presence attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new identity
    Register {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        email: String,
        /// JSON embedding file (array, or object with an "embedding" array); "-" reads stdin
        embedding: PathBuf,
    },
    /// Replace the embedding of a registered identity
    Reenroll {
        #[arg(short, long)]
        email: String,
        /// JSON embedding file; "-" reads stdin
        embedding: PathBuf,
    },
    /// Match an embedding and record attendance
    Authenticate {
        /// JSON embedding file; "-" reads stdin
        embedding: PathBuf,
    },
    /// List attendance events, most recent first
    Attendance,
    /// List registered identities
    Identities,
    /// Show daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.freedesktop.Presence1",
    default_service = "org.freedesktop.Presence1",
    default_path = "/org/freedesktop/Presence1",
    gen_blocking = false
)]
trait Presence {
    async fn register(&self, name: &str, email: &str, embedding: Vec<f64>) -> zbus::Result<i64>;
    async fn reenroll(&self, email: &str, embedding: Vec<f64>) -> zbus::Result<i64>;
    async fn authenticate(&self, embedding: Vec<f64>) -> zbus::Result<String>;
    async fn list_attendance(&self) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

/// Embedding file contents: a bare array, or the `{"embedding": [...]}`
/// body a capture client posts.
#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingFile {
    Bare(Vec<f64>),
    Wrapped { embedding: Vec<f64> },
}

fn parse_embedding(text: &str) -> Result<Vec<f64>> {
    let file: EmbeddingFile =
        serde_json::from_str(text).context("embedding must be a JSON array of numbers")?;
    Ok(match file {
        EmbeddingFile::Bare(values) | EmbeddingFile::Wrapped { embedding: values } => values,
    })
}

fn read_embedding(path: &Path) -> Result<Vec<f64>> {
    let text = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading embedding from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("reading embedding from {}", path.display()))?
    };
    parse_embedding(&text)
}

/// Re-indent a JSON reply from the daemon for the terminal.
fn pretty(json: &str) -> Result<String> {
    let value: serde_json::Value = serde_json::from_str(json).context("daemon sent invalid JSON")?;
    Ok(serde_json::to_string_pretty(&value)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = PresenceProxy::new(&conn)
        .await
        .context("presenced not reachable")?;
    tracing::debug!(system = cli.system, "connected to presenced");

    match cli.command {
        Commands::Register {
            name,
            email,
            embedding,
        } => {
            let values = read_embedding(&embedding)?;
            let id = proxy.register(&name, &email, values).await?;
            println!("Registered {name} <{email}> as identity {id}");
        }
        Commands::Reenroll { email, embedding } => {
            let values = read_embedding(&embedding)?;
            let id = proxy.reenroll(&email, values).await?;
            println!("Re-enrolled identity {id}");
        }
        Commands::Authenticate { embedding } => {
            let values = read_embedding(&embedding)?;
            println!("{}", pretty(&proxy.authenticate(values).await?)?);
        }
        Commands::Attendance => {
            println!("{}", pretty(&proxy.list_attendance().await?)?);
        }
        Commands::Identities => {
            println!("{}", pretty(&proxy.list_identities().await?)?);
        }
        Commands::Status => {
            println!("{}", pretty(&proxy.status().await?)?);
        }
    }

    Ok(())
}
