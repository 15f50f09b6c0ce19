use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facetrack_hw::{FrameSource, V4l2Camera};
use futures_util::StreamExt;
use serde_json::{Map, Value};
use std::path::PathBuf;

// `#[zbus::proxy]` generates `AttendanceProxy` for the daemon interface.
#[zbus::proxy(
    interface = "org.facetrack.Attendance1",
    default_service = "org.facetrack.Attendance1",
    default_path = "/org/facetrack/Attendance1"
)]
trait Attendance {
    async fn enroll(&self, employee_id: &str, name: &str, images: &[String]) -> zbus::Result<String>;
    async fn update(&self, employee_id: &str, name: &str, images: &[String]) -> zbus::Result<String>;
    async fn delete_employee(&self, employee_id: &str) -> zbus::Result<bool>;
    async fn delete_embedding(&self, employee_id: &str, index: u32) -> zbus::Result<bool>;
    async fn prune_embeddings(&self, employee_id: &str, keep: u32) -> zbus::Result<u32>;
    async fn list_embeddings(&self, employee_id: &str) -> zbus::Result<String>;
    async fn list_employees(&self) -> zbus::Result<String>;
    async fn start_camera(&self) -> zbus::Result<()>;
    async fn stop_camera(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
    async fn get_config(&self) -> zbus::Result<String>;
    async fn update_config(&self, changes: &str) -> zbus::Result<String>;
    async fn recent_events(&self, limit: u32) -> zbus::Result<String>;
    async fn presence(&self, employee_id: &str) -> zbus::Result<String>;

    #[zbus(signal)]
    fn attendance_event(&self, payload: String) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "facetrack", about = "facetrack attendance CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,
    /// Print raw JSON replies
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List local V4L2 capture devices
    Devices,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        #[arg(short, long, default_value_t = 10)]
        frames: u32,
    },
    #[command(flatten)]
    Bus(BusCommand),
}

/// Commands served by facetrackd.
#[derive(Subcommand)]
enum BusCommand {
    /// Enroll a new employee from face images
    Enroll {
        employee_id: String,
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Images containing exactly one face each
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Add face images to an enrolled employee
    Update {
        employee_id: String,
        #[arg(short, long)]
        name: String,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Remove an employee and all their embeddings
    Delete { employee_id: String },
    /// Remove one embedding by index
    DeleteEmbedding { employee_id: String, index: u32 },
    /// Keep only the newest embeddings of an employee
    Prune {
        employee_id: String,
        #[arg(short, long, default_value_t = 10)]
        keep: u32,
    },
    /// List enrolled employees
    List,
    /// List an employee's embeddings
    Embeddings { employee_id: String },
    /// Start the camera stream
    Start,
    /// Stop the camera stream
    Stop,
    /// Show stream state and statistics
    Status,
    /// Show the camera configuration
    Config,
    /// Change the camera configuration (restarts a running stream)
    Configure {
        #[arg(long)]
        camera_id: Option<String>,
        #[arg(long)]
        device: Option<String>,
        #[arg(long)]
        recognition_threshold: Option<f32>,
        #[arg(long)]
        detection_threshold: Option<f32>,
        /// Frames per second to capture (0 = as fast as the camera delivers)
        #[arg(long)]
        fps: Option<u32>,
    },
    /// Show recent attendance events
    Events {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Show presence state (all employees if none given)
    Presence { employee_id: Option<String> },
    /// Follow attendance events as they happen
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => list_devices(),
        Commands::Test { device, frames } => camera_test(&device, frames),
        Commands::Bus(command) => run_bus(command, cli.system, cli.json).await,
    }
}

async fn run_bus(command: BusCommand, system: bool, json: bool) -> Result<()> {
    tracing::debug!(system, "connecting to facetrackd");
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("cannot connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("facetrackd is not reachable")?;

    match command {
        BusCommand::Enroll {
            employee_id,
            name,
            images,
        } => {
            let images = absolute_paths(&images)?;
            tracing::debug!(employee_id, images = images.len(), "sending enrollment");
            let reply = proxy.enroll(&employee_id, &name, &images).await?;
            print_record(&reply, json, "enrolled")?;
        }
        BusCommand::Update {
            employee_id,
            name,
            images,
        } => {
            let images = absolute_paths(&images)?;
            let reply = proxy.update(&employee_id, &name, &images).await?;
            print_record(&reply, json, "updated")?;
        }
        BusCommand::Delete { employee_id } => {
            if proxy.delete_employee(&employee_id).await? {
                println!("Deleted {employee_id}");
            } else {
                println!("No employee {employee_id}");
            }
        }
        BusCommand::DeleteEmbedding { employee_id, index } => {
            if proxy.delete_embedding(&employee_id, index).await? {
                println!("Deleted embedding {index} of {employee_id}");
            } else {
                println!("No embedding {index} for {employee_id}");
            }
        }
        BusCommand::Prune { employee_id, keep } => {
            let removed = proxy.prune_embeddings(&employee_id, keep).await?;
            println!("Removed {removed} embedding(s) from {employee_id}");
        }
        BusCommand::List => {
            let reply = proxy.list_employees().await?;
            if json {
                println!("{reply}");
            } else {
                print_employees(&parse(&reply)?);
            }
        }
        BusCommand::Embeddings { employee_id } => {
            let reply = proxy.list_embeddings(&employee_id).await?;
            if json {
                println!("{reply}");
            } else {
                print_embeddings(&parse(&reply)?);
            }
        }
        BusCommand::Start => {
            proxy.start_camera().await?;
            println!("Camera stream started");
        }
        BusCommand::Stop => {
            if proxy.stop_camera().await? {
                println!("Camera stream stopped");
            } else {
                println!("Camera stream was not running");
            }
        }
        BusCommand::Status => {
            let reply = proxy.status().await?;
            println!("{}", pretty(&reply)?);
        }
        BusCommand::Config => {
            let reply = proxy.get_config().await?;
            println!("{}", pretty(&reply)?);
        }
        BusCommand::Configure {
            camera_id,
            device,
            recognition_threshold,
            detection_threshold,
            fps,
        } => {
            let changes = config_changes(
                camera_id,
                device,
                recognition_threshold,
                detection_threshold,
                fps,
            );
            if changes.is_empty() {
                bail!("nothing to change; pass at least one option");
            }
            let changes = Value::Object(changes).to_string();
            tracing::debug!(%changes, "updating camera configuration");
            let reply = proxy.update_config(&changes).await?;
            println!("{}", pretty(&reply)?);
        }
        BusCommand::Events { limit } => {
            let reply = proxy.recent_events(limit).await?;
            if json {
                println!("{reply}");
            } else if let Value::Array(events) = parse(&reply)? {
                if events.is_empty() {
                    println!("No events");
                }
                for event in &events {
                    println!("{}", format_event(event));
                }
            }
        }
        BusCommand::Presence { employee_id } => {
            let reply = proxy.presence(employee_id.as_deref().unwrap_or("")).await?;
            if json {
                println!("{reply}");
            } else {
                print_presence(&parse(&reply)?);
            }
        }
        BusCommand::Watch => {
            let mut events = proxy.receive_attendance_event().await?;
            println!("Watching attendance events (Ctrl+C to stop)");
            while let Some(signal) = events.next().await {
                let args = signal.args()?;
                if json {
                    println!("{}", args.payload());
                } else {
                    println!("{}", format_event(&parse(args.payload())?));
                }
            }
        }
    }

    Ok(())
}

/// JSON object holding only the settings the user asked to change.
fn config_changes(
    camera_id: Option<String>,
    device: Option<String>,
    recognition_threshold: Option<f32>,
    detection_threshold: Option<f32>,
    fps: Option<u32>,
) -> Map<String, Value> {
    let mut changes = Map::new();
    if let Some(v) = camera_id {
        changes.insert("camera_id".into(), v.into());
    }
    if let Some(v) = device {
        changes.insert("camera_device".into(), v.into());
    }
    if let Some(v) = recognition_threshold {
        changes.insert("recognition_threshold".into(), v.into());
    }
    if let Some(v) = detection_threshold {
        changes.insert("detection_threshold".into(), v.into());
    }
    if let Some(v) = fps {
        changes.insert("fps_target".into(), v.into());
    }
    changes
}

/// The daemon resolves paths itself, so send absolute ones.
fn absolute_paths(images: &[PathBuf]) -> Result<Vec<String>> {
    images
        .iter()
        .map(|p| {
            let abs = std::fs::canonicalize(p)
                .with_context(|| format!("cannot read {}", p.display()))?;
            Ok(abs.to_string_lossy().into_owned())
        })
        .collect()
}

fn parse(reply: &str) -> Result<Value> {
    serde_json::from_str(reply).context("daemon returned malformed JSON")
}

fn pretty(reply: &str) -> Result<String> {
    Ok(serde_json::to_string_pretty(&parse(reply)?)?)
}

fn str_field<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(Value::as_str).unwrap_or("-")
}

fn print_record(reply: &str, json: bool, verb: &str) -> Result<()> {
    if json {
        println!("{reply}");
        return Ok(());
    }
    let record = parse(reply)?;
    println!(
        "{} {} ({}) with {} embedding(s)",
        capitalize(verb),
        str_field(&record, "employee_id"),
        str_field(&record, "name"),
        record["embedding_count"]
    );
    Ok(())
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn print_employees(records: &Value) {
    let Some(records) = records.as_array().filter(|r| !r.is_empty()) else {
        println!("No employees enrolled");
        return;
    };
    println!("{:<20} {:<28} {:>10}  ENROLLED", "ID", "NAME", "EMBEDDINGS");
    for r in records {
        println!(
            "{:<20} {:<28} {:>10}  {}",
            str_field(r, "employee_id"),
            str_field(r, "name"),
            r["embedding_count"],
            str_field(r, "enrollment_timestamp")
        );
    }
}

fn print_embeddings(infos: &Value) {
    let Some(infos) = infos.as_array().filter(|i| !i.is_empty()) else {
        println!("No embeddings");
        return;
    };
    println!("{:>5} {:>5}  {:<26} SOURCE", "INDEX", "DIM", "CREATED");
    for i in infos {
        println!(
            "{:>5} {:>5}  {:<26} {}",
            i["index"],
            i["dimension"],
            str_field(i, "created_at"),
            str_field(i, "source_image")
        );
    }
}

fn print_presence(states: &Value) {
    let Some(states) = states.as_array().filter(|s| !s.is_empty()) else {
        println!("No presence state");
        return;
    };
    println!("{:<20} {:<8} LAST SEEN", "ID", "STATUS");
    for s in states {
        println!(
            "{:<20} {:<8} {}",
            str_field(s, "employee_id"),
            str_field(s, "status"),
            str_field(s, "last_seen_timestamp")
        );
    }
}

fn format_event(event: &Value) -> String {
    let confidence = event["confidence"].as_f64().unwrap_or(0.0);
    format!(
        "{}  {:<9} {:<20} camera={} confidence={confidence:.3}",
        str_field(event, "timestamp"),
        str_field(event, "event_type"),
        str_field(event, "employee_id"),
        str_field(event, "camera_id"),
    )
}

fn list_devices() -> Result<()> {
    let devices = V4l2Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in devices {
        println!("{}  {} ({})", d.path, d.name, d.driver);
    }
    Ok(())
}

fn camera_test(device: &str, frames: u32) -> Result<()> {
    println!("Opening {device}...");
    let mut camera = V4l2Camera::open(device, 640, 480)?;
    println!(
        "  {}x{} {:?}",
        camera.width, camera.height, camera.fourcc
    );

    let mut dark = 0;
    let mut captured = 0;
    for _ in 0..frames {
        match camera.read()? {
            Some(frame) => {
                captured += 1;
                if frame.is_dark {
                    dark += 1;
                }
                let mean =
                    frame.data.iter().map(|&p| p as u64).sum::<u64>() / frame.data.len().max(1) as u64;
                println!(
                    "  frame {:>4}: mean brightness {mean:>3}{}",
                    frame.sequence,
                    if frame.is_dark { " (dark)" } else { "" }
                );
            }
            None => {
                println!("  end of stream");
                break;
            }
        }
    }
    println!("Captured {captured} frame(s), {dark} dark");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_event() {
        let event = serde_json::json!({
            "employee_id": "emp-001",
            "event_type": "check_in",
            "timestamp": "2024-05-01T08:00:00Z",
            "confidence": 0.87654,
            "camera_id": "lobby"
        });
        let line = format_event(&event);
        assert!(line.starts_with("2024-05-01T08:00:00Z  check_in"));
        assert!(line.contains("emp-001"));
        assert!(line.contains("camera=lobby"));
        assert!(line.ends_with("confidence=0.877"));
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("enrolled"), "Enrolled");
        assert_eq!(capitalize(""), "");
    }

    #[test]
    fn test_absolute_paths_reject_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("a.png");
        std::fs::write(&present, b"x").unwrap();

        let abs = absolute_paths(&[present.clone()]).unwrap();
        assert!(PathBuf::from(&abs[0]).is_absolute());
        assert!(absolute_paths(&[dir.path().join("missing.png")]).is_err());
    }

    #[test]
    fn test_cli_parses_enroll() {
        let cli = Cli::try_parse_from([
            "facetrack", "enroll", "emp-1", "--name", "Ana", "a.png", "b.png",
        ])
        .unwrap();
        match cli.command {
            Commands::Bus(BusCommand::Enroll {
                employee_id,
                name,
                images,
            }) => {
                assert_eq!(employee_id, "emp-1");
                assert_eq!(name, "Ana");
                assert_eq!(images.len(), 2);
            }
            _ => panic!("expected enroll"),
        }
        assert!(Cli::try_parse_from(["facetrack", "enroll", "emp-1", "--name", "Ana"]).is_err());
    }

    #[test]
    fn test_local_and_bus_commands_share_one_namespace() {
        let cli = Cli::try_parse_from(["facetrack", "test", "--frames", "3"]).unwrap();
        assert!(matches!(cli.command, Commands::Test { frames: 3, .. }));

        let cli = Cli::try_parse_from(["facetrack", "--json", "status"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Bus(BusCommand::Status)));
    }

    #[test]
    fn test_configure_sends_only_given_fields() {
        let cli = Cli::try_parse_from([
            "facetrack",
            "configure",
            "--camera-id",
            "gate",
            "--fps",
            "15",
        ])
        .unwrap();
        let Commands::Bus(BusCommand::Configure {
            camera_id,
            device,
            recognition_threshold,
            detection_threshold,
            fps,
        }) = cli.command
        else {
            panic!("expected configure");
        };
        let changes = config_changes(camera_id, device, recognition_threshold, detection_threshold, fps);
        assert_eq!(
            Value::Object(changes),
            serde_json::json!({"camera_id": "gate", "fps_target": 15})
        );
        assert!(config_changes(None, None, None, None, None).is_empty());
    }
}
