//! MinnowVPN extension CLI
//!
//! Runs one tunnel session over a TUN device with the loopback engine, the
//! way a packet-tunnel host would drive the controller.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use minnowvpn_extension::crypto::x25519;
use minnowvpn_extension::error::ConfigError;
use minnowvpn_extension::{
    ExtensionError, LoopbackEngine, SessionEvent, TunPacketFlow, TunnelController, WireGuardConfig,
};

/// MinnowVPN extension - tunnel session controller
#[derive(Parser, Debug)]
#[command(name = "minnowvpn-extension")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to WireGuard settings (wg-quick .conf or UAPI)
    #[arg(
        short,
        long,
        required_unless_present_any = ["engine_version", "detect_address", "genkey"]
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the engine version and exit
    #[arg(long)]
    engine_version: bool,

    /// Print the detected local address and exit
    #[arg(long)]
    detect_address: bool,

    /// Generate a base64 keypair and exit
    #[arg(long)]
    genkey: bool,
}

type Controller = TunnelController<LoopbackEngine>;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Set up logging
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => match e.downcast_ref::<ExtensionError>() {
            Some(err) => {
                eprintln!("Error: {}", err.user_message());
                ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(255))
            }
            None => {
                eprintln!("Error: {:#}", e);
                ExitCode::from(255)
            }
        },
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    if args.engine_version {
        println!("{}", Controller::engine_version());
        return Ok(());
    }
    if args.detect_address {
        println!("{}", Controller::detect_address());
        return Ok(());
    }
    if args.genkey {
        let (private_key, public_key) = x25519::generate_keypair();
        println!("PrivateKey = {}", BASE64.encode(private_key));
        println!("PublicKey = {}", BASE64.encode(public_key));
        return Ok(());
    }

    let Some(config_path) = args.config else {
        anyhow::bail!("a settings file is required");
    };
    tracing::info!("Loading settings from: {}", config_path.display());
    let config = WireGuardConfig::from_file(&config_path).map_err(ExtensionError::from)?;

    let address = config
        .interface
        .address
        .iter()
        .find_map(|net| match net.addr() {
            IpAddr::V4(addr) => Some((addr, net.prefix_len())),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| {
            ExtensionError::from(ConfigError::MissingField {
                field: "Address (IPv4)".to_string(),
            })
        })?;

    let flow = TunPacketFlow::create(address.0, address.1, config.mtu())
        .map_err(ExtensionError::from)?;
    let interface_name = flow.name().to_string();

    let controller = Controller::new(LoopbackEngine::new());
    let mut events = controller.subscribe();

    controller.set_packet_flow(Arc::new(flow)).await?;
    controller.turn_on(&interface_name, &config.to_uapi()).await?;
    controller.start_reading_packets().await?;

    tracing::info!(
        "Tunnel running on {} (local address {})",
        interface_name,
        Controller::detect_address()
    );

    wait_for_stop(&mut events).await;

    let status = controller.status().await;
    controller.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Wait for Ctrl+C, SIGTERM or a broken packet channel
async fn wait_for_stop(events: &mut tokio::sync::broadcast::Receiver<SessionEvent>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let channel_failed = async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::ChannelFailed { reason, .. }) => return reason,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    std::future::pending::<()>().await;
                }
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
        reason = channel_failed => {
            tracing::error!("Packet channel failed ({}), shutting down...", reason);
        }
    }
}
