//! Tunnel session controller
//!
//! Owns the lifecycle of one tunnel session bound to a host packet flow:
//! - turn on: validate, parse settings, bring up the engine interface
//! - packet pump: host flow <-> engine, on its own task
//! - reassert: rebind the engine without dropping session keys
//! - turn off: stop the pump, tear the interface down, release the flow
//!
//! Every state transition happens under a single async mutex. The pump never
//! takes that lock; when the host channel breaks it reports the failure as an
//! event and asks a separate task to tear the session down.

use std::sync::{Arc, Weak};

use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::config::WireGuardConfig;
use crate::engine::{Engine, EngineHandle, TransferStats};
use crate::error::{ChannelError, ConfigError, EngineError, Result, SessionError};
use crate::flow::{IpFamily, PacketFlow};

/// Buffered events per subscriber before the oldest are dropped
const EVENT_CAPACITY: usize = 16;

/// IFNAMSIZ minus the terminating NUL
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Returned by [`TunnelController::detect_address`] when nothing is found
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Lifecycle state of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    Uninitialized,
    Configured,
    Terminated,
}

/// Notifications for the host, delivered asynchronously
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Configured { interface: String },
    PumpStarted { interface: String },
    Reasserted { interface: String },
    /// The host packet channel broke; the session is being torn down
    ChannelFailed { interface: String, reason: String },
    TurnedOff { interface: String },
}

/// Point-in-time view of the controller
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: ControllerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    pub pumping: bool,
    pub stats: TransferStats,
}

struct Pump {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct ActiveSession<H> {
    id: u64,
    interface_name: String,
    config: WireGuardConfig,
    handle: Arc<H>,
    pump: Option<Pump>,
}

struct Inner<H> {
    session: Option<ActiveSession<H>>,
    packet_flow: Option<Arc<dyn PacketFlow>>,
    next_session_id: u64,
    terminated: bool,
}

/// Controller for a single tunnel session
pub struct TunnelController<E: Engine> {
    engine: E,
    inner: Arc<Mutex<Inner<E::Handle>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl<E: Engine> TunnelController<E> {
    /// Create an unconfigured controller driving `engine`
    pub fn new(engine: E) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            engine,
            inner: Arc::new(Mutex::new(Inner {
                session: None,
                packet_flow: None,
                next_session_id: 1,
                terminated: false,
            })),
            events,
        }
    }

    /// Version of the wrapped engine
    pub fn engine_version() -> String {
        E::version()
    }

    /// Best-effort local address for diagnostics, or [`UNKNOWN_ADDRESS`]
    pub fn detect_address() -> String {
        E::detect_address()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string())
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Attach the host packet flow used by the next session
    pub async fn set_packet_flow(&self, flow: Arc<dyn PacketFlow>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.terminated {
            return Err(SessionError::Terminated.into());
        }
        if let Some(session) = &inner.session {
            return Err(SessionError::AlreadyConfigured {
                interface: session.interface_name.clone(),
            }
            .into());
        }

        inner.packet_flow = Some(flow);
        Ok(())
    }

    /// The packet flow currently held, if any
    pub async fn packet_flow(&self) -> Option<Arc<dyn PacketFlow>> {
        self.inner.lock().await.packet_flow.clone()
    }

    /// Bring up a session on `interface_name` with `settings`.
    ///
    /// Packets only move once [`start_reading_packets`](Self::start_reading_packets)
    /// is called.
    pub async fn turn_on(&self, interface_name: &str, settings: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if inner.terminated {
            return Err(SessionError::Terminated.into());
        }
        if let Some(session) = &inner.session {
            tracing::warn!(
                "Refusing to turn on {}: session already running on {}",
                interface_name,
                session.interface_name
            );
            return Err(SessionError::AlreadyConfigured {
                interface: session.interface_name.clone(),
            }
            .into());
        }

        validate_interface_name(interface_name)?;
        let config = WireGuardConfig::parse_settings(settings)?;
        if inner.packet_flow.is_none() {
            return Err(SessionError::NoPacketFlow.into());
        }

        let handle = self.engine.create_interface(interface_name, &config).await?;

        let id = inner.next_session_id;
        inner.next_session_id += 1;
        inner.session = Some(ActiveSession {
            id,
            interface_name: interface_name.to_string(),
            config,
            handle: Arc::new(handle),
            pump: None,
        });

        tracing::info!("Tunnel configured on {} (engine {})", interface_name, E::version());
        let _ = self.events.send(SessionEvent::Configured {
            interface: interface_name.to_string(),
        });
        Ok(())
    }

    /// Stop the session and release the packet flow. No-op when off.
    pub async fn turn_off(&self) {
        let mut inner = self.inner.lock().await;
        if inner.session.is_none() {
            tracing::debug!("Turn off requested with no active session");
            return;
        }
        shut_down_session(&mut inner, &self.events).await;
    }

    /// Re-apply interface state after a network path change.
    ///
    /// Session keys survive. Failures are returned as-is; retrying is up to
    /// the host.
    pub async fn reassert(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        let session = inner.session.as_ref().ok_or(SessionError::NotConfigured)?;

        if let Err(e) = session.handle.reassert().await {
            tracing::warn!("Reassert failed on {}: {}", session.interface_name, e);
            return Err(e.into());
        }

        let _ = self.events.send(SessionEvent::Reasserted {
            interface: session.interface_name.clone(),
        });
        Ok(())
    }

    /// Start the packet pump. Returns immediately; the pump runs until
    /// [`turn_off`](Self::turn_off), a channel failure or the engine closing.
    pub async fn start_reading_packets(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Inner {
            session,
            packet_flow,
            ..
        } = &mut *inner;

        let session = session.as_mut().ok_or(SessionError::NotConfigured)?;
        if session.pump.is_some() {
            tracing::debug!("Packet pump already running on {}", session.interface_name);
            return Ok(());
        }
        let flow = packet_flow.clone().ok_or(SessionError::NoPacketFlow)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = spawn_pump(
            session.id,
            session.interface_name.clone(),
            flow,
            Arc::clone(&session.handle),
            shutdown_rx,
            Arc::downgrade(&self.inner),
            self.events.clone(),
        );
        session.pump = Some(Pump { shutdown_tx, task });

        tracing::info!("Packet pump started on {}", session.interface_name);
        let _ = self.events.send(SessionEvent::PumpStarted {
            interface: session.interface_name.clone(),
        });
        Ok(())
    }

    /// Turn off and refuse any further session
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if inner.session.is_some() {
            shut_down_session(&mut inner, &self.events).await;
        }
        inner.packet_flow = None;
        inner.terminated = true;
        tracing::info!("Tunnel controller shut down");
    }

    pub async fn is_configured(&self) -> bool {
        self.inner.lock().await.session.is_some()
    }

    pub async fn state(&self) -> ControllerState {
        let inner = self.inner.lock().await;
        state_of(&inner)
    }

    pub async fn interface_name(&self) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.session.as_ref().map(|s| s.interface_name.clone())
    }

    /// Settings the running session was started with
    pub async fn config(&self) -> Option<WireGuardConfig> {
        let inner = self.inner.lock().await;
        inner.session.as_ref().map(|s| s.config.clone())
    }

    pub async fn status(&self) -> SessionStatus {
        let inner = self.inner.lock().await;
        let session = inner.session.as_ref();

        SessionStatus {
            state: state_of(&inner),
            interface: session.map(|s| s.interface_name.clone()),
            pumping: session
                .and_then(|s| s.pump.as_ref())
                .is_some_and(|p| !p.task.is_finished()),
            stats: session.map(|s| s.handle.stats()).unwrap_or_default(),
        }
    }

    /// Receiver for session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Session events as a stream; lagged events are skipped
    pub fn events(&self) -> impl Stream<Item = SessionEvent> {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| event.ok())
    }
}

fn state_of<H>(inner: &Inner<H>) -> ControllerState {
    if inner.terminated {
        ControllerState::Terminated
    } else if inner.session.is_some() {
        ControllerState::Configured
    } else {
        ControllerState::Uninitialized
    }
}

/// Interface names must fit IFNAMSIZ and be usable as a path component
fn validate_interface_name(name: &str) -> std::result::Result<(), ConfigError> {
    let reason = if name.is_empty() {
        "must not be empty"
    } else if name.len() > MAX_INTERFACE_NAME_LEN {
        "longer than 15 bytes"
    } else if name
        .chars()
        .any(|c| c.is_whitespace() || c == '/' || c == '\0')
    {
        "contains whitespace, '/' or NUL"
    } else {
        return Ok(());
    };

    Err(ConfigError::InvalidInterfaceName {
        name: name.to_string(),
        reason: reason.to_string(),
    })
}

/// Stop the pump, tear the interface down and drop the flow.
/// Caller holds the controller lock.
async fn shut_down_session<H: EngineHandle>(
    inner: &mut Inner<H>,
    events: &broadcast::Sender<SessionEvent>,
) {
    let Some(session) = inner.session.take() else {
        return;
    };

    if let Some(pump) = session.pump {
        let _ = pump.shutdown_tx.send(true);
        if let Err(e) = pump.task.await {
            tracing::warn!("Packet pump on {} ended abnormally: {}", session.interface_name, e);
        }
    }

    if let Err(e) = session.handle.teardown().await {
        tracing::warn!("Engine teardown failed on {}: {}", session.interface_name, e);
    }

    inner.packet_flow = None;

    tracing::info!("Tunnel on {} turned off", session.interface_name);
    let _ = events.send(SessionEvent::TurnedOff {
        interface: session.interface_name,
    });
}

/// Why the pump loop returned
enum PumpExit {
    Shutdown,
    EngineClosed,
    Channel(ChannelError),
}

fn spawn_pump<H: EngineHandle>(
    session_id: u64,
    interface_name: String,
    flow: Arc<dyn PacketFlow>,
    handle: Arc<H>,
    shutdown_rx: watch::Receiver<bool>,
    inner: Weak<Mutex<Inner<H>>>,
    events: broadcast::Sender<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match pump_packets(flow, handle, shutdown_rx).await {
            PumpExit::Shutdown => {
                tracing::debug!("Packet pump on {} stopped", interface_name);
            }
            PumpExit::EngineClosed => {
                tracing::info!("Engine closed {}; ending session", interface_name);
                request_teardown(inner, events, session_id);
            }
            PumpExit::Channel(e) => {
                tracing::error!("Packet channel failed on {}: {}", interface_name, e);
                let _ = events.send(SessionEvent::ChannelFailed {
                    interface: interface_name,
                    reason: e.to_string(),
                });
                request_teardown(inner, events, session_id);
            }
        }
    })
}

/// Tear down `session_id` from outside the pump, unless the host already
/// turned it off.
fn request_teardown<H: EngineHandle>(
    inner: Weak<Mutex<Inner<H>>>,
    events: broadcast::Sender<SessionEvent>,
    session_id: u64,
) {
    let Some(inner) = inner.upgrade() else {
        return;
    };

    tokio::spawn(async move {
        let mut inner = inner.lock().await;
        if inner.session.as_ref().map(|s| s.id) == Some(session_id) {
            shut_down_session(&mut inner, &events).await;
        }
    });
}

/// Resolves once turn off is requested or the controller is dropped
async fn stop_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    // A dropped sender means the controller itself is gone
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

async fn pump_packets<H: EngineHandle>(
    flow: Arc<dyn PacketFlow>,
    handle: Arc<H>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> PumpExit {
    loop {
        tokio::select! {
            biased;

            _ = stop_requested(&mut shutdown_rx) => return PumpExit::Shutdown,

            outbound = flow.read_packet() => {
                let packet = match outbound {
                    Ok(packet) => packet,
                    Err(e) => return PumpExit::Channel(e),
                };
                let sent = tokio::select! {
                    biased;
                    _ = stop_requested(&mut shutdown_rx) => return PumpExit::Shutdown,
                    sent = handle.send(&packet) => sent,
                };
                match sent {
                    Ok(()) => {}
                    Err(EngineError::Closed) => return PumpExit::EngineClosed,
                    Err(e) => tracing::warn!("Dropped outbound packet: {}", e),
                }
            }

            inbound = handle.recv() => {
                let packet = match inbound {
                    Ok(packet) => packet,
                    Err(EngineError::Closed) => return PumpExit::EngineClosed,
                    Err(e) => {
                        tracing::warn!("Engine receive error: {}", e);
                        continue;
                    }
                };
                let Some(family) = IpFamily::of_packet(&packet) else {
                    tracing::debug!("Dropped inbound packet with unknown IP version");
                    continue;
                };
                // The host may stop draining; turn off must still get through
                let written = tokio::select! {
                    biased;
                    _ = stop_requested(&mut shutdown_rx) => return PumpExit::Shutdown,
                    written = flow.write_packet(&packet, family) => written,
                };
                if let Err(e) = written {
                    return PumpExit::Channel(e);
                }
            }
        }
    }
}
