//! Patrol CLI: drives a field client session from the terminal.

mod location;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::json;

use patrol_client::{ClientConfig, Session};
use patrol_rounds::{Confirmation, RoundEvent};
use patrol_transport::OutgoingMessage;
use patrol_types::{CheckpointId, Round, RoundId};
use patrol_utils::{format_duration, LogFormat};

use crate::location::FixedLocation;

/// Bound on waiting for a socket namespace to connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "patrol", about = "Headless patrol field client")]
struct Cli {
    /// Path to a TOML configuration file. If provided, file settings
    /// are used as the base; CLI flags and env vars override them.
    #[arg(long, env = "PATROL_CONFIG")]
    config: Option<PathBuf>,

    /// REST API base URL.
    #[arg(long, env = "PATROL_API_URL")]
    api_url: Option<String>,

    /// Socket.IO server origin (defaults to the API URL).
    #[arg(long, env = "PATROL_SOCKET_URL")]
    socket_url: Option<String>,

    /// Bearer token from a successful login.
    #[arg(long, env = "PATROL_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Log level: "trace", "debug", "info", "warn", "error".
    #[arg(long, env = "PATROL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format: "human" or "json".
    #[arg(long, env = "PATROL_LOG_FORMAT")]
    log_format: Option<String>,

    /// Subcommand.
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Start a round.
    Start { round: u64 },

    /// Prove presence at a checkpoint of an in-progress round.
    Checkpoint {
        round: u64,
        checkpoint: u64,
        #[command(subcommand)]
        proof: Proof,
    },

    /// End an in-progress round.
    End {
        round: u64,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Follow tracking pushes until interrupted. With a round, fold them
    /// into it and print the resulting round events.
    Watch {
        #[arg(long)]
        round: Option<u64>,
    },

    /// Send a chat message to a room.
    Chat { room: String, message: String },

    /// Print the effective configuration.
    Config,
}

#[derive(clap::Subcommand)]
enum Proof {
    /// Current position.
    Gps {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
        /// Reported accuracy in meters.
        #[arg(long, default_value_t = 5.0)]
        accuracy: f64,
    },
    /// Scanned QR code text.
    Qr { code: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let format: LogFormat = config
        .log_format
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    patrol_utils::init_tracing(&config.log_level, format);
    tracing::debug!(api = %config.api_url, socket = %config.socket_origin(), "config loaded");

    if let Command::Config = cli.command {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let location = match &cli.command {
        Command::Checkpoint {
            proof: Proof::Gps { lat, lon, accuracy },
            ..
        } => FixedLocation::new(Some(*lat), Some(*lon), *accuracy),
        _ => FixedLocation::new(None, None, 0.0),
    };
    let session = Session::connect(config, Arc::new(location), None);
    let token = cli
        .token
        .context("a session token is required (--token or PATROL_TOKEN)")?;
    session.login(token);

    let result = run(&session, cli.command).await;
    session.logout();
    result
}

fn load_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(api_url) = &cli.api_url {
        config.api_url = api_url.clone();
    }
    if let Some(socket_url) = &cli.socket_url {
        config.socket_url = Some(socket_url.clone());
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.log_format = format.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run(session: &Session, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Start { round } => {
            let round = session.start_round(RoundId::new(round)).await?;
            print_round(&round);
        }
        Command::Checkpoint {
            round,
            checkpoint,
            proof,
        } => {
            session.resume_round(RoundId::new(round)).await?;
            let checkpoint = CheckpointId::new(checkpoint);
            let confirmation = match proof {
                Proof::Gps { .. } => session.verify_gps(checkpoint).await,
                Proof::Qr { code } => session.verify_qr(checkpoint, &code).await,
            };
            match confirmation {
                Ok(confirmation) => print_confirmation(&confirmation),
                Err(e) => {
                    if let Some(log) = session.machine().log(checkpoint) {
                        eprintln!("checkpoint {checkpoint} left {:?}", log.status);
                    }
                    return Err(anyhow::anyhow!("{e} ({:?})", e.kind()));
                }
            }
        }
        Command::End { round, notes } => {
            let id = RoundId::new(round);
            session.resume_round(id).await?;
            let round = session.end_round(id, notes.as_deref()).await?;
            print_round(&round);
        }
        Command::Watch { round } => watch(session, round.map(RoundId::new)).await?,
        Command::Chat { room, message } => {
            let chat = session.chat()?;
            chat.connection().wait_connected(CONNECT_TIMEOUT).await?;
            chat.join_room(&room)?;
            chat.send_message(&OutgoingMessage {
                room_id: room.clone(),
                content: message,
            })?;
            // Let the writer flush before the session disposes the link.
            tokio::time::sleep(Duration::from_millis(200)).await;
            println!("sent to {room}");
        }
        Command::Config => {}
    }
    Ok(())
}

async fn watch(session: &Session, round: Option<RoundId>) -> anyhow::Result<()> {
    let tracking = session.tracking()?;
    let connection = tracking.connection();

    let mut subscriptions = Vec::new();
    for event in [
        patrol_transport::tracking::ROUND_UPDATED,
        patrol_transport::tracking::ROUND_VERIFIED,
        patrol_transport::tracking::CHECKPOINT_CONFIRMED,
        patrol_transport::tracking::CHECKPOINT_REJECTED,
        patrol_transport::events::CONNECT,
        patrol_transport::events::DISCONNECT,
        patrol_transport::events::CONNECT_ERROR,
    ] {
        subscriptions.push(connection.on(event, move |payload| {
            println!("{}", json!({ "event": event, "payload": payload }));
        }));
    }

    let sync = match round {
        Some(id) => {
            session.resume_round(id).await?;
            Some(session.attach_sync()?)
        }
        None => None,
    };
    let mut events = session.machine().subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv(), if sync.is_some() => match event {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "round events lagged");
                }
                Err(_) => break,
            },
        }
    }

    if let Some(sync) = sync {
        sync.detach();
    }
    for subscription in subscriptions {
        subscription.unsubscribe();
    }
    Ok(())
}

fn print_round(round: &Round) {
    let (confirmed, total) = round.progress();
    let duration = round
        .start
        .zip(round.end)
        .map(|(start, end)| format_duration(start.elapsed_since(end)));
    println!(
        "{}",
        json!({
            "round": round.id,
            "name": round.name,
            "status": round.status,
            "start": round.start,
            "end": round.end,
            "duration": duration,
            "confirmed": confirmed,
            "total": total,
        })
    );
}

fn print_confirmation(confirmation: &Confirmation) {
    println!(
        "{}",
        json!({
            "round": confirmation.round,
            "checkpoint": confirmation.checkpoint,
            "serverAt": confirmation.server_at,
            "progress": confirmation.progress,
        })
    );
}

fn print_event(event: &RoundEvent) {
    let line = match event {
        RoundEvent::Installed { round } => json!({ "installed": round.id }),
        RoundEvent::StatusChanged { round, status } => {
            json!({ "round": round, "status": status })
        }
        RoundEvent::CheckpointPending { round, checkpoint } => {
            json!({ "round": round, "checkpoint": checkpoint, "log": "pending" })
        }
        RoundEvent::CheckpointConfirmed {
            round,
            checkpoint,
            server_at,
            progress,
        } => json!({
            "round": round,
            "checkpoint": checkpoint,
            "log": "confirmed",
            "serverAt": server_at,
            "progress": progress,
        }),
        RoundEvent::CheckpointRejected {
            round,
            checkpoint,
            reason,
        } => json!({
            "round": round,
            "checkpoint": checkpoint,
            "log": "rejected",
            "reason": reason.to_string(),
        }),
        RoundEvent::Discarded { round } => json!({ "discarded": round }),
    };
    println!("{line}");
}
