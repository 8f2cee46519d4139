use anyhow::{Context, bail};
use chrono::Local;
use clap::{Parser, ValueEnum};
use log::{info, warn};
use portal_calls::calls::mock::{MockMediaDevices, MockPeerFactory};
use portal_calls::calls::{
    CallEvent, CallHandle, CallManager, CallManagerConfig, CallOptions, CallState, DeviceKind,
    LocalRelay, PermissionState, StaticDirectory, Tone, ToneError, TonePlayer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// Simulates a direct call between two in-process participants over a local
// signal relay, with mock devices and peer connections.
//
// Usage:
//   cargo run                                  # alice calls bob, bob answers
//   cargo run -- --video --talk-secs 5
//   cargo run -- --scenario decline
//   cargo run -- --scenario ignore --ring-timeout-secs 3
//   cargo run -- --scenario denied             # caller's camera access is blocked

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Callee accepts and both sides talk.
    Answer,
    /// Callee declines.
    Decline,
    /// Callee lets it ring out.
    Ignore,
    /// Caller has previously denied device access.
    Denied,
}

#[derive(Debug, Parser)]
#[command(name = "callsim", about = "Simulate a direct call between two participants")]
struct Args {
    #[arg(long, default_value = "alice")]
    caller: String,

    #[arg(long, default_value = "bob")]
    callee: String,

    /// Place a video call instead of an audio call.
    #[arg(long)]
    video: bool,

    #[arg(long, value_enum, default_value_t = Scenario::Answer)]
    scenario: Scenario,

    /// How long the call stays up once active.
    #[arg(long, default_value_t = 2)]
    talk_secs: u64,

    #[arg(long, default_value_t = 10)]
    ring_timeout_secs: u64,
}

/// Tone player that logs instead of making noise.
struct LogTonePlayer(String);

impl TonePlayer for LogTonePlayer {
    fn start_loop(&self, tone: Tone) -> Result<(), ToneError> {
        info!("[{}] ♪ {:?} playing", self.0, tone);
        Ok(())
    }

    fn stop(&self) {
        info!("[{}] ♪ stopped", self.0);
    }
}

async fn participant(
    id: &str,
    relay: &LocalRelay,
    devices: MockMediaDevices,
    directory: Arc<StaticDirectory>,
    config: CallManagerConfig,
) -> anyhow::Result<CallHandle> {
    CallManager::builder(
        id,
        Arc::new(relay.clone()),
        Arc::new(devices),
        Arc::new(MockPeerFactory::new(id)),
    )
    .tone_player(Arc::new(LogTonePlayer(id.to_string())))
    .directory(directory)
    .config(config)
    .spawn()
    .await
    .with_context(|| format!("failed to start call manager for {id}"))
}

/// Wait until the call is active or over. Returns whether it became active.
async fn wait_for_outcome(events: &mut broadcast::Receiver<CallEvent>) -> anyhow::Result<bool> {
    loop {
        match events.recv().await {
            Ok(CallEvent::StateChanged {
                state: CallState::Active { .. },
                ..
            }) => return Ok(true),
            Ok(CallEvent::CallEnded { message, .. }) => {
                info!("Call ended: {}", message);
                return Ok(false);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} call events", n),
            Err(broadcast::error::RecvError::Closed) => bail!("call manager stopped"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let args = Args::parse();
    let relay = LocalRelay::new();
    let directory = Arc::new(
        StaticDirectory::new()
            .with(args.caller.as_str(), &format!("{} (caller)", args.caller))
            .with(args.callee.as_str(), &format!("{} (callee)", args.callee)),
    );
    let config = CallManagerConfig {
        ring_timeout: Duration::from_secs(args.ring_timeout_secs),
        ..CallManagerConfig::default()
    };

    let caller_devices = MockMediaDevices::new();
    if args.scenario == Scenario::Denied {
        caller_devices.set_permission(DeviceKind::Microphone, PermissionState::Denied);
        caller_devices.set_permission(DeviceKind::Camera, PermissionState::Denied);
    }

    let caller = participant(
        &args.caller,
        &relay,
        caller_devices,
        directory.clone(),
        config.clone(),
    )
    .await?;
    let callee = participant(
        &args.callee,
        &relay,
        MockMediaDevices::new(),
        directory,
        config,
    )
    .await?;

    let mut callee_events = callee.subscribe();
    let scenario = args.scenario;
    let answering = callee.clone();
    let responder = tokio::spawn(async move {
        while let Ok(event) = callee_events.recv().await {
            match event {
                CallEvent::IncomingCall { call_id, from, kind } => {
                    info!(
                        "{} is calling ({} call {})",
                        from.display_name, kind, call_id
                    );
                    let result = match scenario {
                        Scenario::Decline => answering.decline().await,
                        Scenario::Ignore => Ok(()),
                        Scenario::Answer | Scenario::Denied => answering.accept().await,
                    };
                    if let Err(e) = result {
                        warn!("Could not respond to call {}: {}", call_id, e);
                    }
                }
                CallEvent::CallEnded { .. } => break,
                _ => {}
            }
        }
    });

    let mut caller_events = caller.subscribe();
    let options = if args.video {
        CallOptions::video()
    } else {
        CallOptions::audio()
    };
    let call_id = caller.start_call(args.callee.as_str(), options).await?;
    info!("{} dialing {} (call {})", args.caller, args.callee, call_id);

    if wait_for_outcome(&mut caller_events).await? {
        info!("Call {} is active, talking for {}s", call_id, args.talk_secs);
        tokio::time::sleep(Duration::from_secs(args.talk_secs) / 2).await;
        let audio_on = caller.toggle_mute().await?;
        info!("{} {}", args.caller, if audio_on { "unmuted" } else { "muted" });
        tokio::time::sleep(Duration::from_secs(args.talk_secs) / 2).await;
        caller.end_call().await?;
    }

    if scenario == Scenario::Denied {
        // Nothing was ever sent, so the callee has nothing to see.
        responder.abort();
    } else if tokio::time::timeout(Duration::from_secs(5), responder)
        .await
        .is_err()
    {
        warn!("Callee never saw the call end");
    }

    for handle in [&caller, &callee] {
        match handle.last_call().await {
            Some(session) => println!(
                "{}: {}",
                handle.local_id(),
                serde_json::to_string_pretty(&session)?
            ),
            None => println!("{}: no call recorded", handle.local_id()),
        }
    }

    caller.shutdown().await;
    callee.shutdown().await;
    Ok(())
}
