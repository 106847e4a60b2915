//! CallRTC loopback - places a real WebRTC call between two in-process users
//!
//! Both participants share one in-memory signaling store, so the run
//! exercises the full negotiation path (offer, answer, trickled ICE, status
//! updates) and the native peer connections without any external service.

use anyhow::{bail, Context, Result};
use callrtc_calls::{
    conversation_id, CallConfig, CallContext, CallOrchestrator, CallStatus, IceTransportPolicy,
    RtcBackendFactory, SampleTrackSource,
};
use callrtc_signaling::MemoryStore;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for the loopback call.
#[derive(Parser, Debug, Clone)]
#[command(name = "callrtc-loopback")]
#[command(about = "Place a loopback audio/video call through an in-memory signaling store")]
#[command(version)]
struct CliArgs {
    /// Configuration file path (TOML)
    #[arg(long, short = 'c', env = "CALLRTC_CONFIG")]
    config: Option<PathBuf>,

    /// User id of the caller
    #[arg(long, default_value = "alice")]
    caller: String,

    /// User id of the callee
    #[arg(long, default_value = "bob")]
    callee: String,

    /// Seconds to wait for both sides to connect
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Seconds to stay connected before hanging up
    #[arg(long, default_value = "3")]
    hold: u64,

    /// Only use TURN relay candidates
    #[arg(long)]
    force_relay: bool,

    /// Log level
    #[arg(long, default_value = "info", env = "CALLRTC_LOG")]
    log_level: String,
}

fn load_config(args: &CliArgs) -> Result<CallConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let mut config = CallConfig::from_toml_file(path)?;
            config.apply_env();
            config
        }
        None => CallConfig::from_env(),
    };
    if args.force_relay {
        config.ice_transport_policy = IceTransportPolicy::Relay;
    }
    config.validate().context("Invalid call configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting CallRTC loopback v{}", env!("CARGO_PKG_VERSION"));

    if args.caller == args.callee {
        bail!("caller and callee must be different users");
    }

    let config = load_config(&args)?;
    let store = Arc::new(MemoryStore::new(config.session_root.clone()));
    let media = Arc::new(SampleTrackSource::new(true).with_silence());
    let peers = Arc::new(RtcBackendFactory::new(media));

    let caller = CallOrchestrator::new(CallContext::new(
        args.caller.clone(),
        config.clone(),
        store.clone(),
        peers.clone(),
    ))
    .context("Invalid caller")?;
    let callee = CallOrchestrator::new(CallContext::new(
        args.callee.clone(),
        config,
        store,
        peers,
    ))
    .context("Invalid callee")?;

    let conversation = conversation_id(&args.caller, &args.callee);
    info!("Conversation: {}", conversation);

    let result = run_call(&caller, &callee, &conversation, &args).await;

    caller.cleanup().await;
    callee.cleanup().await;

    match &result {
        Ok(()) => info!("Loopback call finished"),
        Err(e) => error!("Loopback call failed: {:#}", e),
    }
    result
}

async fn run_call(
    caller: &CallOrchestrator,
    callee: &CallOrchestrator,
    conversation: &str,
    args: &CliArgs,
) -> Result<()> {
    let timeout = Duration::from_secs(args.timeout);

    callee.observe(conversation)?;
    caller.start_call(conversation, &args.callee)?;

    let ringing = callee
        .wait_for(|s| s.incoming_offer || s.disposed, timeout)
        .await
        .context("Callee never saw the offer")?;
    if !ringing.incoming_offer {
        bail!("callee stopped before the offer arrived: {:?}", ringing.error);
    }
    info!("{} is ringing, accepting", args.callee);
    callee.accept_call(conversation)?;

    for (name, side) in [(&args.caller, caller), (&args.callee, callee)] {
        let snapshot = side
            .wait_for(
                |s| s.status == CallStatus::Connected || s.status.is_terminal(),
                timeout,
            )
            .await
            .with_context(|| format!("{} did not connect within {:?}", name, timeout))?;
        if snapshot.status != CallStatus::Connected {
            bail!(
                "{} finished as {} ({})",
                name,
                snapshot.status,
                snapshot.error.unwrap_or_default()
            );
        }
        info!("{} connected", name);
    }

    let hold = Duration::from_secs(args.hold);
    tokio::time::sleep(hold).await;

    caller.end_call(conversation, hold)?;
    callee
        .wait_for(|s| s.disposed, timeout)
        .await
        .context("Callee did not observe the hang-up")?;

    let ended = callee.snapshot();
    info!(status = %ended.status, history = ?ended.history, "Callee finished");
    Ok(())
}
