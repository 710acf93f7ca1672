use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_hw::Camera;
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn status(&self) -> zbus::Result<String>;
    fn present(&self) -> zbus::Result<String>;
    fn refresh_roster(&self) -> zbus::Result<bool>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance monitor CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// List identities currently present
    Present {
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Reload the roster from the backend now
    Refresh,
    /// List V4L2 capture devices
    Devices,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Frames to capture
        #[arg(short = 'n', long, default_value_t = 5)]
        frames: usize,
        /// Save the last captured frame to this path
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let status = proxy(cli.session).await?.status().await?;
            let value: serde_json::Value =
                serde_json::from_str(&status).context("daemon returned invalid status")?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Present { json } => {
            let present = proxy(cli.session).await?.present().await?;
            let value: serde_json::Value =
                serde_json::from_str(&present).context("daemon returned invalid presence list")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                let lines = present_lines(&value);
                if lines.is_empty() {
                    println!("nobody present");
                }
                for line in lines {
                    println!("{line}");
                }
            }
        }
        Commands::Refresh => {
            if proxy(cli.session).await?.refresh_roster().await? {
                println!("roster refresh requested");
            } else {
                bail!("daemon refused roster refresh");
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("no capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Test {
            device,
            frames,
            save,
        } => camera_test(&device, frames, save)?,
    }

    Ok(())
}

async fn proxy(session: bool) -> Result<AttendanceProxy<'static>> {
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")
}

fn camera_test(device: &str, frames: usize, save: Option<PathBuf>) -> Result<()> {
    let camera = Camera::open(device, 640, 480).with_context(|| format!("opening {device}"))?;
    println!(
        "{device}: {}x{} {:?}",
        camera.width,
        camera.height,
        camera.pixel_format()
    );

    let mut stream = camera.stream()?;
    let mut last = None;
    for _ in 0..frames.max(1) {
        let frame = stream.next_frame()?;
        println!(
            "  frame {:>4}  brightness {:>6.1}{}",
            frame.sequence,
            frame.avg_brightness(),
            if frame.is_dark { "  (dark)" } else { "" }
        );
        last = Some(frame);
    }

    if let (Some(path), Some(frame)) = (save, last) {
        frame
            .image
            .save(&path)
            .with_context(|| format!("saving {}", path.display()))?;
        println!("saved {}", path.display());
    }
    Ok(())
}

fn clock(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "?".into())
}

/// One line per present record.
fn present_lines(value: &serde_json::Value) -> Vec<String> {
    let Some(records) = value.as_array() else {
        return Vec::new();
    };
    records
        .iter()
        .map(|r| {
            let identity = r["key"]["identity"].as_str().unwrap_or("?");
            let session = match r["sync"]["state"].as_str() {
                Some("synced") => r["sync"]["session_id"].as_str().unwrap_or("?").to_string(),
                Some(state) => format!("<{state}>"),
                None => "<unknown>".into(),
            };
            format!(
                "{identity:<16} since {}  last {}  score {:.3}  session {session}",
                clock(r["first_seen_ms"].as_i64().unwrap_or(0)),
                clock(r["last_seen_ms"].as_i64().unwrap_or(0)),
                r["last_confidence"].as_f64().unwrap_or(0.0),
            )
        })
        .collect()
}
