use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "presence", about = "Presence face-recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the faces in a photo without marking attendance
    Recognize {
        /// Image file (JPEG, PNG, ...)
        image: PathBuf,
    },
    /// Mark every recognized student in a photo present
    Mark {
        /// Image file (JPEG, PNG, ...)
        image: PathBuf,
    },
    /// Show present and absent students
    Report,
    /// Clear attendance for a new session
    Reset,
    /// Show daemon status
    Status,
}

// `#[zbus::proxy]` generates `PresenceProxy` for the daemon's interface.
#[zbus::proxy(
    interface = "org.freedesktop.Presence1",
    default_service = "org.freedesktop.Presence1",
    default_path = "/org/freedesktop/Presence1"
)]
trait Presence {
    async fn recognize(&self, image: &[u8]) -> zbus::Result<String>;
    async fn mark_attendance(&self, image: &[u8]) -> zbus::Result<String>;
    async fn attendance_report(&self) -> zbus::Result<String>;
    async fn reset_attendance(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Re-indent a JSON reply; anything that is not JSON is printed as-is.
fn pretty(reply: &str) -> String {
    serde_json::from_str::<serde_json::Value>(reply)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| reply.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let connection = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    let proxy = PresenceProxy::new(&connection)
        .await
        .context("presenced is not reachable")?;

    let reply = match cli.command {
        Commands::Recognize { image } => {
            let bytes = read_image(&image)?;
            tracing::debug!(path = %image.display(), bytes = bytes.len(), "sending image");
            proxy.recognize(&bytes).await?
        }
        Commands::Mark { image } => {
            let bytes = read_image(&image)?;
            tracing::debug!(path = %image.display(), bytes = bytes.len(), "sending image");
            proxy.mark_attendance(&bytes).await?
        }
        Commands::Report => proxy.attendance_report().await?,
        Commands::Reset => proxy.reset_attendance().await?,
        Commands::Status => proxy.status().await?,
    };

    println!("{}", pretty(&reply));
    Ok(())
}
