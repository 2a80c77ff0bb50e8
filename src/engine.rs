//! Engine runtime
//!
//! One task owns all link state and runs the event loop: driver events,
//! host commands, the discovery cycle, and periodic cleanup all multiplex
//! through a single `select!`. Blocking driver calls (connect, disconnect,
//! identity reads, writes) are routed through the blocking worker so the
//! loop never stalls; their completions come back as events.

use crate::config::{ConfigError, EngineConfig};
use crate::driver::{
    Advertisement, BleDriver, DriverError, DriverEvent, GattProfile, DEFAULT_MTU, RSSI_UNKNOWN,
    SERVICE_UUID,
};
use crate::host::{MeshHost, PeerHandle};
use crate::identity::{Identity, MacAddress};
use crate::link::handshake::{classify_inbound, verify_remote_identity, InboundPayload};
use crate::link::orchestrator::{DialError, Orchestrator, RETRY_BACKOFF};
use crate::peer::record::PeerState;
use crate::peer::registry::{BindOutcome, BlacklistPolicy, PeerRegistry, RegistryError};
use crate::peer::selection::{select_candidates, SelectionParams};
use crate::wire::fragment::{FragmentError, Fragmenter};
use crate::wire::reassembly::{Reassembly, ReassemblyStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, info, trace, warn};

/// Cadence of the cleanup sweep (reassembly buffers, blacklists, stale peers)
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Cadence of the attempt-deadline check
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// How often the local identity is polled during startup
const IDENTITY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Errors surfaced by the engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Local identity unavailable after {0:?}")]
    IdentityUnavailable(Duration),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Codec error: {0}")]
    Codec(#[from] FragmentError),

    #[error("No active link for peer {}", .0.short())]
    UnknownPeer(Identity),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Engine task not running")]
    NotRunning,
}

/// Commands the handle sends into the engine task
#[derive(Debug)]
pub enum EngineCommand {
    /// Fragment and send a packet to an active peer
    SendPacket {
        peer: PeerHandle,
        packet: Vec<u8>,
        reply: mpsc::Sender<Result<(), String>>,
    },
    /// Tear down a peer link deliberately
    ClosePeer {
        peer: PeerHandle,
        reply: mpsc::Sender<Result<(), String>>,
    },
    /// List currently active peers
    ActivePeers { reply: mpsc::Sender<Vec<PeerHandle>> },
    /// Drain and stop
    Shutdown { reply: mpsc::Sender<()> },
}

/// Handle to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    command_tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    /// Fragment `packet` and write it to the peer's link.
    ///
    /// Returns once every fragment has been accepted by the driver; the
    /// next packet for the same peer starts only after that.
    pub async fn process_outgoing(&self, peer: PeerHandle, packet: Vec<u8>) -> anyhow::Result<()> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(EngineCommand::SendPacket {
                peer,
                packet,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Engine task not running"))?;

        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from engine"))?
            .map_err(|e| anyhow::anyhow!(e))
    }

    /// Deliberately close a peer link
    pub async fn close_peer(&self, peer: PeerHandle) -> anyhow::Result<()> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(EngineCommand::ClosePeer {
                peer,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Engine task not running"))?;

        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from engine"))?
            .map_err(|e| anyhow::anyhow!(e))
    }

    /// Handles of all peers with a live identified link
    pub async fn active_peers(&self) -> anyhow::Result<Vec<PeerHandle>> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(EngineCommand::ActivePeers { reply: reply_tx })
            .await
            .map_err(|_| anyhow::anyhow!("Engine task not running"))?;

        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from engine"))
    }

    /// Shut the engine down: drain in-flight work within the configured
    /// bound, disconnect every peer, stop the driver.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(EngineCommand::Shutdown { reply: reply_tx })
            .await
            .map_err(|_| anyhow::anyhow!("Engine task not running"))?;

        // The engine replies once cleanup finished (or timed out)
        let _ = reply_rx.recv().await;
        Ok(())
    }
}

/// Completions of handshake tasks running off the event loop
#[derive(Debug)]
enum InternalEvent {
    HandshakeDone { mac: MacAddress, identity: Identity },
    HandshakeFailed { mac: MacAddress, reason: String },
}

/// Where the discovery cycle currently is
#[derive(Debug, Clone, Copy)]
enum ScanPhase {
    /// Waiting for the next cycle
    Idle { next: tokio::time::Instant },
    /// Radio is scanning until the window closes
    Scanning { until: tokio::time::Instant },
}

impl ScanPhase {
    fn deadline(&self) -> tokio::time::Instant {
        match self {
            ScanPhase::Idle { next } => *next,
            ScanPhase::Scanning { until } => *until,
        }
    }
}

/// One active identified link
#[derive(Debug)]
struct Link {
    identity: Identity,
    fragmenter: Fragmenter,
}

/// The engine entry point
pub struct Engine;

impl Engine {
    /// Validate the configuration, bring the driver up, and spawn the
    /// engine task. Fails when the configuration is invalid, the upper
    /// stack never produces an identity, or the driver cannot register
    /// its service.
    pub async fn start(
        config: EngineConfig,
        driver: Arc<dyn BleDriver>,
        host: Arc<dyn MeshHost>,
    ) -> Result<EngineHandle, EngineError> {
        config.validate()?;

        let local_identity = wait_for_identity(host.as_ref(), config.identity_wait_timeout).await?;
        let local_mac = host.local_mac();
        info!(
            identity = %local_identity.short(),
            mac = ?local_mac.map(|m| m.to_string()),
            "starting BLE mesh engine"
        );

        let (events_tx, events_rx) = mpsc::channel(256);
        driver.start(&GattProfile::default(), events_tx.clone())?;
        driver.set_identity(local_identity)?;

        if config.enable_peripheral {
            if let Err(e) = driver.start_advertising(config.device_name.as_deref()) {
                warn!(error = %e, "advertising failed, continuing central-only");
            }
        }

        let registry = Arc::new(PeerRegistry::new(config.max_discovered_peers));
        let policy = BlacklistPolicy {
            threshold: config.max_failures_before_blacklist,
            ..BlacklistPolicy::default()
        };
        let orchestrator = Orchestrator::new(registry.clone(), policy);
        let reassembly = ReassemblyStore::new(config.connection_timeout, config.max_inflight_bytes);

        let (command_tx, command_rx) = mpsc::channel(64);
        let (internal_tx, internal_rx) = mpsc::channel(64);

        let state = EngineState {
            config,
            driver,
            host,
            registry,
            orchestrator,
            links: HashMap::new(),
            route: HashMap::new(),
            pending_mtu: HashMap::new(),
            attempt_started: HashMap::new(),
            reassembly,
            local_identity,
            local_mac,
            events_tx,
            internal_tx,
            scan_phase: ScanPhase::Idle {
                next: tokio::time::Instant::now(),
            },
        };

        tokio::spawn(state.run(events_rx, command_rx, internal_rx));

        Ok(EngineHandle { command_tx })
    }
}

/// Poll the upper stack for the local identity until it materializes
async fn wait_for_identity(
    host: &dyn MeshHost,
    timeout: Duration,
) -> Result<Identity, EngineError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(identity) = host.local_identity() {
            return Ok(identity);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(EngineError::IdentityUnavailable(timeout));
        }
        trace!("waiting for upper stack identity");
        tokio::time::sleep(IDENTITY_POLL_INTERVAL).await;
    }
}

struct EngineState {
    config: EngineConfig,
    driver: Arc<dyn BleDriver>,
    host: Arc<dyn MeshHost>,
    registry: Arc<PeerRegistry>,
    orchestrator: Orchestrator,
    /// Active links by transport address
    links: HashMap<MacAddress, Link>,
    /// Outbound routing: identity to current transport address
    route: HashMap<Identity, MacAddress>,
    /// MTU reported at link-up, consumed when the link activates
    pending_mtu: HashMap<MacAddress, u16>,
    /// Attempt start times, for the connection timeout
    attempt_started: HashMap<MacAddress, Instant>,
    reassembly: ReassemblyStore,
    local_identity: Identity,
    local_mac: Option<MacAddress>,
    events_tx: mpsc::Sender<DriverEvent>,
    internal_tx: mpsc::Sender<InternalEvent>,
    scan_phase: ScanPhase,
}

impl EngineState {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<DriverEvent>,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut internal: mpsc::Receiver<InternalEvent>,
    ) {
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);

        loop {
            let scan_deadline = self.scan_phase.deadline();

            tokio::select! {
                Some(event) = events.recv() => {
                    trace!(event = %event, "driver event");
                    self.handle_driver_event(event);
                }

                Some(event) = internal.recv() => {
                    self.handle_internal_event(event);
                }

                Some(command) = commands.recv() => {
                    if self.handle_command(command).await {
                        break;
                    }
                }

                _ = cleanup.tick() => {
                    self.run_cleanup();
                }

                _ = maintenance.tick() => {
                    self.check_attempt_deadlines();
                }

                _ = tokio::time::sleep_until(scan_deadline), if self.config.enable_central => {
                    self.advance_scan();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Discovery cycle
    // ------------------------------------------------------------------

    fn advance_scan(&mut self) {
        let now = tokio::time::Instant::now();
        let mode = self.config.power_mode;

        self.scan_phase = match self.scan_phase {
            ScanPhase::Idle { .. } => {
                // Scanner and connection initiation cannot overlap on this
                // driver family
                if !self.orchestrator.scan_gate_open() {
                    debug!(
                        pending = self.orchestrator.connecting().len(),
                        "scan gated by in-flight connection attempts"
                    );
                    ScanPhase::Idle {
                        next: now + mode.idle_between_scans(self.config.scan_interval, true),
                    }
                } else if mode.suppress_scan_when_connected() && self.registry.active_count() > 0 {
                    debug!("saver mode: skipping scan while peers are connected");
                    ScanPhase::Idle {
                        next: now + mode.idle_between_scans(self.config.scan_interval, true),
                    }
                } else {
                    match self.driver.start_scanning() {
                        Ok(()) => ScanPhase::Scanning {
                            until: now + mode.scan_window(),
                        },
                        Err(e) => {
                            warn!(error = %e, "scan start failed");
                            ScanPhase::Idle {
                                next: now + mode.idle_between_scans(self.config.scan_interval, true),
                            }
                        }
                    }
                }
            }
            ScanPhase::Scanning { .. } => {
                if let Err(e) = self.driver.stop_scanning() {
                    warn!(error = %e, "scan stop failed");
                }
                self.run_selection();
                ScanPhase::Idle {
                    next: now + mode.idle_between_scans(self.config.scan_interval, false),
                }
            }
        };
    }

    fn run_selection(&mut self) {
        let now = Instant::now();
        let params = SelectionParams {
            max_peers: self.config.max_peers,
            min_rssi: self.config.min_rssi,
            connect_rate_limit: self.config.connect_rate_limit,
            local_mac: self.local_mac,
        };
        let snapshot = self.registry.snapshot();
        let candidates = select_candidates(&snapshot, &params, now);

        for mac in candidates {
            match self.orchestrator.begin_dial(mac, now) {
                Ok(()) => {
                    self.attempt_started.insert(mac, now);
                    self.spawn_dial(mac);
                }
                Err(DialError::AlreadyConnecting(_)) => {}
                Err(e) => debug!(mac = %mac, error = %e, "candidate not dialable"),
            }
        }
    }

    /// Dial off the event loop, retrying transient failures within the
    /// attempt. Success or failure comes back as a driver event.
    fn spawn_dial(&self, mac: MacAddress) {
        let driver = self.driver.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let mut error = None;
            for (attempt, delay) in std::iter::once(&Duration::ZERO)
                .chain(RETRY_BACKOFF.iter())
                .enumerate()
            {
                if !delay.is_zero() {
                    tokio::time::sleep(*delay).await;
                }
                let d = driver.clone();
                match task::spawn_blocking(move || d.connect(mac)).await {
                    Ok(Ok(())) => return,
                    Ok(Err(e)) if e.is_transient() => {
                        debug!(mac = %mac, attempt, error = %e, "connect retry");
                        error = Some(e);
                    }
                    Ok(Err(e)) => {
                        error = Some(e);
                        break;
                    }
                    Err(join_err) => {
                        error = Some(DriverError::ConnectFailed(join_err.to_string()));
                        break;
                    }
                }
            }
            let error = error.unwrap_or(DriverError::Timeout);
            let _ = events.send(DriverEvent::ConnectFailed { mac, error }).await;
        });
    }

    // ------------------------------------------------------------------
    // Driver events
    // ------------------------------------------------------------------

    fn handle_driver_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Discovered(advert) => self.handle_advert(advert),
            DriverEvent::Connected { mac, mtu } => self.handle_connected(mac, mtu),
            DriverEvent::Disconnected { mac } => self.handle_disconnected(mac),
            DriverEvent::Data { mac, bytes } => self.handle_data(mac, bytes),
            DriverEvent::ConnectFailed { mac, error } => {
                warn!(mac = %mac, error = %error, "connection attempt failed");
                self.fail_attempt(mac);
            }
        }
    }

    fn handle_advert(&mut self, advert: Advertisement) {
        if advert.rssi == RSSI_UNKNOWN {
            trace!(mac = %advert.mac, "discarding advertisement with unknown RSSI");
            return;
        }
        if !advert.matches_service(SERVICE_UUID) {
            return;
        }
        if self.local_mac == Some(advert.mac) {
            return;
        }
        if advert.rssi < self.config.min_rssi {
            debug!(
                mac = %advert.mac,
                rssi = advert.rssi,
                min = self.config.min_rssi,
                "rejecting weak advertisement"
            );
            return;
        }

        let created =
            self.registry
                .upsert_from_advert(advert.mac, advert.rssi, advert.name, Instant::now());
        if created {
            debug!(mac = %advert.mac, rssi = advert.rssi, "discovered new peer");
        }
    }

    fn handle_connected(&mut self, mac: MacAddress, mtu: u16) {
        let mtu = if mtu == 0 { self.driver.peer_mtu(mac) } else { mtu };
        let mtu = mtu.max(DEFAULT_MTU);
        self.pending_mtu.insert(mac, mtu);

        let dialing = self
            .registry
            .get(&mac)
            .map(|p| p.state == PeerState::Dialing)
            .unwrap_or(false);

        if dialing {
            // Our dial succeeded; run the central side of the handshake
            if let Err(e) = self.orchestrator.link_up(mac) {
                warn!(mac = %mac, error = %e, "link up in unexpected state");
                return;
            }
            debug!(mac = %mac, mtu, "link up, starting handshake");
            let inferred = self.registry.identity_of(&mac);
            self.spawn_central_handshake(mac, inferred);
        } else {
            // A remote central connected to our GATT server; its identity
            // arrives as the first write
            self.orchestrator.inbound_link(mac, Instant::now());
            self.attempt_started.insert(mac, Instant::now());
            debug!(mac = %mac, mtu, "inbound link, awaiting identity");
        }
    }

    /// Central handshake: settle, read the remote identity, announce ours.
    /// A failed write is not fatal; the remote can still learn us from
    /// its own scan (degraded mode).
    fn spawn_central_handshake(&self, mac: MacAddress, inferred: Option<Identity>) {
        let driver = self.driver.clone();
        let internal = self.internal_tx.clone();
        let delay = self.config.service_discovery_delay;
        let local_identity = self.local_identity;

        tokio::spawn(async move {
            // Let the peripheral stack finish registering characteristics
            tokio::time::sleep(delay).await;

            let d = driver.clone();
            let read = task::spawn_blocking(move || d.read_identity(mac)).await;

            let outcome = match read {
                Ok(Ok(bytes)) => match verify_remote_identity(inferred, &bytes) {
                    Ok(Some(identity)) => {
                        let d = driver.clone();
                        let write =
                            task::spawn_blocking(move || d.send(mac, local_identity.as_bytes()))
                                .await;
                        match write {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                warn!(mac = %mac, error = %e, "identity write failed, continuing degraded")
                            }
                            Err(e) => {
                                warn!(mac = %mac, error = %e, "identity write failed, continuing degraded")
                            }
                        }
                        InternalEvent::HandshakeDone { mac, identity }
                    }
                    Ok(None) => InternalEvent::HandshakeFailed {
                        mac,
                        reason: "peer exposes no identity".to_string(),
                    },
                    Err(e) => InternalEvent::HandshakeFailed {
                        mac,
                        reason: e.to_string(),
                    },
                },
                Ok(Err(e)) => InternalEvent::HandshakeFailed {
                    mac,
                    reason: e.to_string(),
                },
                Err(e) => InternalEvent::HandshakeFailed {
                    mac,
                    reason: e.to_string(),
                },
            };

            let _ = internal.send(outcome).await;
        });
    }

    fn handle_internal_event(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::HandshakeDone { mac, identity } => {
                self.install_link(mac, identity);
            }
            InternalEvent::HandshakeFailed { mac, reason } => {
                warn!(mac = %mac, reason = %reason, "handshake failed");
                self.fail_attempt(mac);
            }
        }
    }

    fn handle_disconnected(&mut self, mac: MacAddress) {
        let had_link = self.links.contains_key(&mac);
        let was_connecting = self.orchestrator.connecting().contains(&mac);

        if !had_link && !was_connecting && self.registry.get(&mac).is_none() {
            return;
        }
        debug!(mac = %mac, had_link, "link dropped");

        self.orchestrator.begin_teardown(mac);
        if let Some(identity) = self.release_link(mac) {
            self.host.peer_gone(identity);
        }
        self.orchestrator
            .finish_teardown(mac, had_link, !had_link && was_connecting, Instant::now());
    }

    fn handle_data(&mut self, mac: MacAddress, bytes: Vec<u8>) {
        let now = Instant::now();

        if let Some(link) = self.links.get(&mac) {
            let identity = link.identity;
            match classify_inbound(Some(identity), &bytes) {
                InboundPayload::Handshake(identity) => {
                    // Repeated announcement: freshness only
                    self.registry.bind_identity(mac, identity, now);
                }
                InboundPayload::Data => match self.reassembly.ingest(identity, &bytes, now) {
                    Ok(Reassembly::Complete(packet)) => {
                        self.host.inbound(PeerHandle::new(identity), packet);
                    }
                    Ok(Reassembly::Incomplete) => {}
                    Err(e) => {
                        warn!(peer = %identity.short(), error = %e, "reassembly error, buffer dropped")
                    }
                },
            }
            return;
        }

        // No identified link yet: only a handshake is meaningful here
        match classify_inbound(None, &bytes) {
            InboundPayload::Handshake(identity) => {
                let pending = self
                    .registry
                    .get(&mac)
                    .map(|p| p.state == PeerState::HandshakePending)
                    .unwrap_or(false);
                if !pending {
                    // First contact without a Connected event
                    self.orchestrator.inbound_link(mac, now);
                    self.attempt_started.insert(mac, now);
                }
                self.install_link(mac, identity);
            }
            InboundPayload::Data => {
                debug!(mac = %mac, len = bytes.len(), "dropping data from unidentified peer");
            }
        }
    }

    // ------------------------------------------------------------------
    // Link installation and teardown
    // ------------------------------------------------------------------

    /// Bind the identity, activate the state machine, and wire up the
    /// fragmenter/reassembler pair. Shared by both handshake directions.
    fn install_link(&mut self, mac: MacAddress, identity: Identity) {
        let now = Instant::now();

        if self.links.get(&mac).map(|l| l.identity) == Some(identity) {
            // Repeated handshake on a live link: freshness only
            self.registry.bind_identity(mac, identity, now);
            return;
        }

        match self.registry.bind_identity(mac, identity, now) {
            BindOutcome::Bound | BindOutcome::AlreadyBound => {}
            BindOutcome::ReplacedIdentity { previous } => {
                // Same device, new logical peer: close the old one
                info!(
                    mac = %mac,
                    old = %previous.short(),
                    new = %identity.short(),
                    "peer identity changed, replacing logical peer"
                );
                if let Some(old_mac) = self.route.remove(&previous) {
                    self.links.remove(&old_mac);
                }
                self.reassembly.release(&previous);
                self.host.peer_gone(previous);
            }
            BindOutcome::ReplacedMac { previous_mac } => {
                // Same logical peer on a rotated address
                info!(
                    identity = %identity.short(),
                    old_mac = %previous_mac,
                    new_mac = %mac,
                    "peer address rotated"
                );
                if let Some(old_link) = self.links.remove(&previous_mac) {
                    self.route.remove(&old_link.identity);
                    self.reassembly.release(&old_link.identity);
                    self.host.peer_gone(old_link.identity);
                }
                self.disconnect_device(previous_mac);
            }
        }

        if let Err(e) = self.orchestrator.activate(mac) {
            warn!(mac = %mac, error = %e, "activation failed");
            return;
        }
        self.attempt_started.remove(&mac);

        let mtu = self.pending_mtu.remove(&mac).unwrap_or(DEFAULT_MTU);
        let fragmenter = match Fragmenter::new(mtu) {
            Ok(f) => f,
            Err(_) => Fragmenter::new(DEFAULT_MTU).expect("minimum MTU is valid"),
        };

        self.links.insert(mac, Link { identity, fragmenter });
        self.route.insert(identity, mac);
        self.reassembly.attach(identity);

        let handle = PeerHandle::new(identity);
        info!(peer = %identity.short(), mac = %mac, mtu, "peer active");
        self.host.peer_appeared(identity, handle);
    }

    /// Release engine-side link resources and schedule driver-side cleanup.
    /// Returns the identity when an active link was torn down.
    fn release_link(&mut self, mac: MacAddress) -> Option<Identity> {
        self.pending_mtu.remove(&mac);
        self.attempt_started.remove(&mac);

        let identity = self.links.remove(&mac).map(|link| {
            self.route.remove(&link.identity);
            self.reassembly.release(&link.identity);
            link.identity
        });

        self.disconnect_device(mac);
        identity
    }

    /// Driver-side cleanup off the loop; both calls are idempotent
    fn disconnect_device(&self, mac: MacAddress) {
        let driver = self.driver.clone();
        task::spawn_blocking(move || {
            driver.disconnect(mac).ok();
            driver.remove_device(mac).ok();
        });
    }

    /// Unwind a connection attempt that will not become a link
    fn fail_attempt(&mut self, mac: MacAddress) {
        self.orchestrator.begin_teardown(mac);
        if let Some(identity) = self.release_link(mac) {
            self.host.peer_gone(identity);
        }
        self.orchestrator
            .finish_teardown(mac, false, true, Instant::now());
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Returns true when the engine should stop
    async fn handle_command(&mut self, command: EngineCommand) -> bool {
        match command {
            EngineCommand::SendPacket { peer, packet, reply } => {
                let result = self.send_packet(peer, packet).await;
                let _ = reply.send(result.map_err(|e| e.to_string())).await;
                false
            }
            EngineCommand::ClosePeer { peer, reply } => {
                let result = self.close_peer(peer);
                let _ = reply.send(result.map_err(|e| e.to_string())).await;
                false
            }
            EngineCommand::ActivePeers { reply } => {
                let peers = self.route.keys().map(|id| PeerHandle::new(*id)).collect();
                let _ = reply.send(peers).await;
                false
            }
            EngineCommand::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(()).await;
                true
            }
        }
    }

    async fn send_packet(&mut self, peer: PeerHandle, packet: Vec<u8>) -> Result<(), EngineError> {
        let identity = peer.identity();
        let mac = *self
            .route
            .get(&identity)
            .ok_or(EngineError::UnknownPeer(identity))?;
        let link = self
            .links
            .get(&mac)
            .ok_or(EngineError::UnknownPeer(identity))?;

        let frames = link.fragmenter.fragment_to_wire(&packet)?;
        let count = frames.len();

        for frame in frames {
            let driver = self.driver.clone();
            match task::spawn_blocking(move || driver.send(mac, &frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // Drop the rest of the packet; the upper stack retransmits
                    warn!(peer = %identity.short(), error = %e, "send failed mid-packet");
                    return Err(EngineError::Driver(e));
                }
                Err(e) => {
                    return Err(EngineError::Driver(DriverError::WriteFailed(e.to_string())))
                }
            }
        }

        trace!(peer = %identity.short(), bytes = packet.len(), fragments = count, "packet sent");
        Ok(())
    }

    fn close_peer(&mut self, peer: PeerHandle) -> Result<(), EngineError> {
        let identity = peer.identity();
        let mac = *self
            .route
            .get(&identity)
            .ok_or(EngineError::UnknownPeer(identity))?;

        debug!(peer = %identity.short(), "closing peer on request");
        self.orchestrator.begin_teardown(mac);
        if let Some(identity) = self.release_link(mac) {
            self.host.peer_gone(identity);
        }
        self.orchestrator
            .finish_teardown(mac, true, false, Instant::now());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------

    fn run_cleanup(&mut self) {
        let now = Instant::now();

        let dropped = self.reassembly.sweep(now);
        let report = self.registry.sweep(now, self.config.stale_peer_timeout);

        if dropped > 0 || report.expired_blacklists > 0 || report.released > 0 {
            debug!(
                stale_buffers = dropped,
                expired_blacklists = report.expired_blacklists,
                released_peers = report.released,
                "cleanup sweep"
            );
        }
    }

    fn check_attempt_deadlines(&mut self) {
        let now = Instant::now();
        let timeout = self.config.connection_timeout;
        let expired: Vec<MacAddress> = self
            .attempt_started
            .iter()
            .filter(|(_, started)| now.duration_since(**started) > timeout)
            .map(|(mac, _)| *mac)
            .collect();

        for mac in expired {
            warn!(mac = %mac, timeout_secs = timeout.as_secs(), "connection attempt timed out");
            self.fail_attempt(mac);
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    async fn shutdown(&mut self) {
        info!("engine shutting down");

        let drained =
            tokio::time::timeout(self.config.shutdown_timeout, self.drain()).await;
        if drained.is_err() {
            warn!("shutdown drain timed out, forcing cleanup");
        }
        self.force_clean();
    }

    /// Orderly teardown of every link within the shutdown bound
    async fn drain(&mut self) {
        self.driver.stop_scanning().ok();
        self.driver.stop_advertising().ok();

        let macs: Vec<MacAddress> = self.links.keys().copied().collect();
        for mac in macs {
            self.orchestrator.begin_teardown(mac);
            if let Some(identity) = self.release_link(mac) {
                self.host.peer_gone(identity);
            }
            self.orchestrator
                .finish_teardown(mac, true, false, Instant::now());
        }

        for mac in self.orchestrator.connecting().drain() {
            self.registry.force_state(mac, PeerState::Discovered).ok();
            self.disconnect_device(mac);
        }
    }

    /// Last-resort cleanup: everything released, driver stopped
    fn force_clean(&mut self) {
        for (_, link) in self.links.drain() {
            self.reassembly.release(&link.identity);
        }
        self.route.clear();
        self.pending_mtu.clear();
        self.attempt_started.clear();
        self.driver.stop().ok();
        info!("engine stopped");
    }
}
