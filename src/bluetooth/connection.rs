/// Connection lifecycle for paired devices
///
/// A single actor task owns every `Connection` and applies all state
/// transitions, so no two transitions for one address are ever in flight at
/// once. Connect attempts, link teardowns and notification forwarding run as
/// their own tasks and report back to the actor through its command queue;
/// a slow attempt on one device never holds up another.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use uuid::Uuid;

use crate::bluetooth::decoder::{profile_for, GattProfile};
use crate::bluetooth::radio::{Link, Radio};
use crate::bluetooth::scanner::{DiscoveryEvent, Scanner};
use crate::error::ConnectError;
use crate::models::{ConnectionState, LinkStatus, PairedDevice, PeripheralHandle, RawNotification, VitalKind};
use crate::registry::DeviceRegistry;
use crate::telemetry::{ReadingPipeline, TelemetryEmitter, TelemetryEvent};
use crate::utils::normalize_address;

const TRANSITION_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How often paired devices are checked for a connection
    pub poll_interval: Duration,
    /// Upper bound on opening a link, per attempt
    pub connect_timeout: Duration,
    /// Failed attempts after which polls skip the device
    pub max_attempts: u32,
    /// Device kinds fetched from the registry on each poll
    pub kinds: Vec<VitalKind>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            max_attempts: 20,
            kinds: VitalKind::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub attempt_count: u32,
    pub connected_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    pub address: String,
    pub state: ConnectionState,
    pub attempt_count: u32,
}

struct PollCandidate {
    device: PairedDevice,
    handle: Option<PeripheralHandle>,
}

/// A link that made it through discovery and subscription
struct Established {
    link: Arc<dyn Link>,
    service: Uuid,
    characteristic: Uuid,
    notifications: BoxStream<'static, Vec<u8>>,
    disconnected: BoxFuture<'static, ()>,
}

type AttemptReply = oneshot::Sender<Result<(), ConnectError>>;

enum Command {
    Poll(Vec<PollCandidate>),
    Connect {
        device: PairedDevice,
        handle: PeripheralHandle,
        reply: AttemptReply,
    },
    Progress {
        address: String,
        attempt: u64,
        state: ConnectionState,
    },
    AttemptFinished {
        address: String,
        attempt: u64,
        outcome: Result<Established, ConnectError>,
    },
    LinkLost {
        address: String,
        generation: u64,
        link_down: bool,
    },
    Disconnect {
        address: String,
        reply: oneshot::Sender<()>,
    },
    TeardownComplete {
        address: String,
        generation: u64,
        reply: Option<oneshot::Sender<()>>,
    },
    Snapshot {
        address: String,
        reply: oneshot::Sender<Option<ConnectionSnapshot>>,
    },
    Start,
    Stop {
        reply: oneshot::Sender<()>,
    },
    StopComplete {
        reply: oneshot::Sender<()>,
    },
}

struct PendingAttempt {
    id: u64,
    reply: Option<AttemptReply>,
}

struct Subscription {
    generation: u64,
    link: Arc<dyn Link>,
    forwarder: JoinHandle<()>,
    tearing_down: bool,
}

struct Connection {
    state: ConnectionState,
    attempt_count: u32,
    connected_at: Option<OffsetDateTime>,
    attempt: Option<PendingAttempt>,
    subscription: Option<Subscription>,
}

impl Connection {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt_count: 0,
            connected_at: None,
            attempt: None,
            subscription: None,
        }
    }
}

struct ManagerInner {
    commands: mpsc::UnboundedSender<Command>,
    registry: Arc<dyn DeviceRegistry>,
    scanner: Scanner,
    config: ConnectionConfig,
    transitions: broadcast::Sender<StateTransition>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the connection lifecycle manager
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn spawn(
        config: ConnectionConfig,
        radio: Arc<dyn Radio>,
        scanner: Scanner,
        registry: Arc<dyn DeviceRegistry>,
        emitter: TelemetryEmitter,
        pipeline: ReadingPipeline,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);

        let actor = ManagerActor {
            config: config.clone(),
            radio,
            registry: registry.clone(),
            emitter,
            pipeline,
            commands: commands.downgrade(),
            transitions: transitions.clone(),
            connections: HashMap::new(),
            accepting: true,
            next_attempt: 0,
            next_generation: 0,
        };
        tokio::spawn(actor.run(rx, scanner.subscribe()));

        Self {
            inner: Arc::new(ManagerInner {
                commands,
                registry,
                scanner,
                config,
                transitions,
                poller: Mutex::new(None),
            }),
        }
    }

    /// Start the polling loop; no-op if it is already running
    pub async fn start(&self) {
        let mut poller = self.inner.poller.lock().await;
        if poller.as_ref().map_or(false, |task| !task.is_finished()) {
            debug!("Connection polling already running");
            return;
        }

        self.send(Command::Start);
        let manager = self.clone();
        let every = self.inner.config.poll_interval;
        *poller = Some(tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.poll_once().await;
            }
        }));
        info!("Connection polling started every {}s", every.as_secs());
    }

    /// Halt polling and tear down every live link
    pub async fn stop(&self) {
        if let Some(task) = self.inner.poller.lock().await.take() {
            task.abort();
        }

        let (reply, done) = oneshot::channel();
        self.send(Command::Stop { reply });
        let _ = done.await;
        info!("Connection manager stopped");
    }

    /// One poll tick: try every paired, disconnected, in-range device
    pub async fn poll_once(&self) {
        let mut candidates = Vec::new();

        for kind in &self.inner.config.kinds {
            let devices = match self.inner.registry.list_paired(*kind).await {
                Ok(devices) => devices,
                Err(e) => {
                    // A partial list would look like unpairing, so skip the tick
                    error!("Failed to list paired {} devices: {}", kind, e);
                    return;
                }
            };

            for device in devices.into_iter().filter(|device| device.is_paired) {
                let address = normalize_address(&device.address);
                let handle = self
                    .inner
                    .scanner
                    .lookup(&address)
                    .await
                    .and_then(|peripheral| peripheral.connection_handle);
                candidates.push(PollCandidate {
                    device: PairedDevice { address, ..device },
                    handle,
                });
            }
        }

        self.send(Command::Poll(candidates));
    }

    /// Run a single connection attempt now and report how it ended
    pub async fn connect(&self, address: &str) -> Result<(), ConnectError> {
        let address = normalize_address(address);
        let device = self
            .find_paired(&address)
            .await
            .ok_or_else(|| ConnectError::NotPaired(address.clone()))?;
        let handle = self
            .inner
            .scanner
            .lookup(&address)
            .await
            .and_then(|peripheral| peripheral.connection_handle)
            .ok_or_else(|| ConnectError::OutOfRange(address.clone()))?;

        let (reply, outcome) = oneshot::channel();
        self.send(Command::Connect {
            device,
            handle,
            reply,
        });
        outcome.await.unwrap_or(Err(ConnectError::Stopped))
    }

    /// Tear down a device's link; returns once the connection is gone
    pub async fn disconnect(&self, address: &str) {
        let (reply, done) = oneshot::channel();
        self.send(Command::Disconnect {
            address: normalize_address(address),
            reply,
        });
        let _ = done.await;
    }

    pub async fn snapshot(&self, address: &str) -> Option<ConnectionSnapshot> {
        let (reply, snapshot) = oneshot::channel();
        self.send(Command::Snapshot {
            address: normalize_address(address),
            reply,
        });
        snapshot.await.ok().flatten()
    }

    pub async fn state(&self, address: &str) -> ConnectionState {
        self.snapshot(address)
            .await
            .map_or(ConnectionState::Disconnected, |snapshot| snapshot.state)
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.inner.transitions.subscribe()
    }

    async fn find_paired(&self, address: &str) -> Option<PairedDevice> {
        for kind in &self.inner.config.kinds {
            match self.inner.registry.list_paired(*kind).await {
                Ok(devices) => {
                    let found = devices.into_iter().find(|device| {
                        device.is_paired && normalize_address(&device.address) == address
                    });
                    if let Some(device) = found {
                        return Some(PairedDevice {
                            address: address.to_string(),
                            ..device
                        });
                    }
                }
                Err(e) => error!("Failed to list paired {} devices: {}", kind, e),
            }
        }
        None
    }

    fn send(&self, command: Command) {
        if self.inner.commands.send(command).is_err() {
            error!("Connection manager task is gone");
        }
    }
}

/// Send to the actor from a spawned task, if it is still running
fn send_to(commands: &mpsc::WeakUnboundedSender<Command>, command: Command) {
    if let Some(tx) = commands.upgrade() {
        let _ = tx.send(command);
    }
}

struct ManagerActor {
    config: ConnectionConfig,
    radio: Arc<dyn Radio>,
    registry: Arc<dyn DeviceRegistry>,
    emitter: TelemetryEmitter,
    pipeline: ReadingPipeline,
    commands: mpsc::WeakUnboundedSender<Command>,
    transitions: broadcast::Sender<StateTransition>,
    connections: HashMap<String, Connection>,
    accepting: bool,
    next_attempt: u64,
    next_generation: u64,
}

impl ManagerActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut discovery: broadcast::Receiver<DiscoveryEvent>,
    ) {
        let mut discovery_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                event = discovery.recv(), if discovery_open => match event {
                    Ok(DiscoveryEvent::PeripheralDiscovered(peripheral)) => {
                        self.restore_budget(&peripheral.address);
                    }
                    Ok(DiscoveryEvent::PeripheralUpdated(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Missed {} discovery events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => discovery_open = false,
                },
            }
        }
        debug!("Connection manager task stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Poll(candidates) => self.on_poll(candidates),
            Command::Connect {
                device,
                handle,
                reply,
            } => self.on_connect(device, handle, reply),
            Command::Progress {
                address,
                attempt,
                state,
            } => self.on_progress(&address, attempt, state),
            Command::AttemptFinished {
                address,
                attempt,
                outcome,
            } => self.on_attempt_finished(address, attempt, outcome),
            Command::LinkLost {
                address,
                generation,
                link_down,
            } => {
                if let Some(link) = self.release(&address, generation) {
                    if !link_down {
                        self.spawn_teardown(address, generation, link, None);
                    }
                }
            }
            Command::Disconnect { address, reply } => self.on_disconnect(address, reply),
            Command::TeardownComplete {
                address,
                generation,
                reply,
            } => {
                self.release(&address, generation);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Command::Snapshot { address, reply } => {
                let snapshot = self.connections.get(&address).map(|connection| ConnectionSnapshot {
                    state: connection.state,
                    attempt_count: connection.attempt_count,
                    connected_at: connection.connected_at,
                });
                let _ = reply.send(snapshot);
            }
            Command::Start => self.accepting = true,
            Command::Stop { reply } => self.on_stop(reply),
            Command::StopComplete { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn on_poll(&mut self, candidates: Vec<PollCandidate>) {
        if !self.accepting {
            debug!("Ignoring poll tick while stopped");
            return;
        }

        let paired: HashSet<&str> = candidates
            .iter()
            .map(|candidate| candidate.device.address.as_str())
            .collect();
        let unpaired: Vec<String> = self
            .connections
            .keys()
            .filter(|address| !paired.contains(address.as_str()))
            .cloned()
            .collect();
        for address in unpaired {
            self.forget(&address);
        }

        for candidate in candidates {
            let address = candidate.device.address.clone();
            let (state, attempt_count) = self
                .connections
                .get(&address)
                .map_or((ConnectionState::Disconnected, 0), |connection| {
                    (connection.state, connection.attempt_count)
                });

            if state != ConnectionState::Disconnected {
                continue;
            }
            if attempt_count >= self.config.max_attempts {
                debug!(
                    "Skipping {}: {} failed attempts, waiting for rediscovery",
                    address, attempt_count
                );
                continue;
            }
            match candidate.handle {
                Some(handle) => self.begin_attempt(candidate.device, handle, None),
                None => debug!("{} not in range", address),
            }
        }
    }

    fn on_connect(&mut self, device: PairedDevice, handle: PeripheralHandle, reply: AttemptReply) {
        if !self.accepting {
            let _ = reply.send(Err(ConnectError::Stopped));
            return;
        }

        match self.connections.get(&device.address).map(|connection| connection.state) {
            Some(ConnectionState::Connected) => {
                let _ = reply.send(Err(ConnectError::AlreadyConnected(device.address)));
            }
            None | Some(ConnectionState::Disconnected) => {
                self.begin_attempt(device, handle, Some(reply));
            }
            Some(_) => {
                let _ = reply.send(Err(ConnectError::AttemptInProgress(device.address)));
            }
        }
    }

    fn begin_attempt(&mut self, device: PairedDevice, handle: PeripheralHandle, reply: Option<AttemptReply>) {
        self.next_attempt += 1;
        let attempt = self.next_attempt;
        let address = device.address.clone();

        let connection = self
            .connections
            .entry(address.clone())
            .or_insert_with(Connection::new);
        connection.state = ConnectionState::Connecting;
        connection.attempt = Some(PendingAttempt { id: attempt, reply });
        let attempt_count = connection.attempt_count;

        info!(
            "Connecting to {} ({}, {}), {} previous failures",
            address, device.display_name, device.vital_kind, attempt_count
        );
        self.announce(&address, ConnectionState::Connecting, attempt_count);

        let radio = self.radio.clone();
        let commands = self.commands.clone();
        let profile = profile_for(device.vital_kind);
        let connect_timeout = self.config.connect_timeout;
        tokio::spawn(async move {
            let outcome =
                run_attempt(radio, handle, profile, connect_timeout, &address, attempt, &commands).await;
            send_to(
                &commands,
                Command::AttemptFinished {
                    address,
                    attempt,
                    outcome,
                },
            );
        });
    }

    fn on_progress(&mut self, address: &str, attempt: u64, state: ConnectionState) {
        let Some(connection) = self.connections.get_mut(address) else {
            return;
        };
        if connection.attempt.as_ref().map(|pending| pending.id) != Some(attempt) {
            return;
        }
        connection.state = state;
        let attempt_count = connection.attempt_count;
        self.announce(address, state, attempt_count);
    }

    fn on_attempt_finished(
        &mut self,
        address: String,
        attempt: u64,
        outcome: Result<Established, ConnectError>,
    ) {
        let current = self
            .connections
            .get(&address)
            .and_then(|connection| connection.attempt.as_ref())
            .map_or(false, |pending| pending.id == attempt);
        if !current {
            debug!("Discarding stale attempt {} for {}", attempt, address);
            self.discard(&address, outcome);
            return;
        }

        let accepting = self.accepting;
        let max_attempts = self.config.max_attempts;
        let Some(connection) = self.connections.get_mut(&address) else {
            return;
        };
        let reply = connection.attempt.take().and_then(|pending| pending.reply);

        if !accepting {
            connection.state = ConnectionState::Disconnected;
            let attempt_count = connection.attempt_count;
            self.announce(&address, ConnectionState::Disconnected, attempt_count);
            self.discard(&address, outcome);
            if let Some(reply) = reply {
                let _ = reply.send(Err(ConnectError::Stopped));
            }
            return;
        }

        match outcome {
            Err(e) => {
                connection.state = ConnectionState::Disconnected;
                connection.attempt_count += 1;
                let attempt_count = connection.attempt_count;

                warn!(
                    "Connection attempt {} to {} failed: {}",
                    attempt_count, address, e
                );
                if attempt_count >= max_attempts {
                    warn!(
                        "Giving up on {} until it is re-paired or rediscovered by a new scan",
                        address
                    );
                }
                self.announce(&address, ConnectionState::Disconnected, attempt_count);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
            }
            Ok(established) => {
                self.on_established(address, established);
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }

    fn on_established(&mut self, address: String, established: Established) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let now = OffsetDateTime::now_utc();

        let forwarder = tokio::spawn(forward_notifications(
            address.clone(),
            established.service,
            established.characteristic,
            established.notifications,
            established.disconnected,
            self.pipeline.clone(),
            self.commands.clone(),
            generation,
        ));

        let connection = self
            .connections
            .entry(address.clone())
            .or_insert_with(Connection::new);
        connection.state = ConnectionState::Connected;
        connection.attempt_count = 0;
        connection.connected_at = Some(now);
        connection.subscription = Some(Subscription {
            generation,
            link: established.link,
            forwarder,
            tearing_down: false,
        });

        info!("Connected to {}", address);
        self.announce(&address, ConnectionState::Connected, 0);

        let registry = self.registry.clone();
        let seen_address = address.clone();
        tokio::spawn(async move {
            if let Err(e) = registry.set_last_seen(&seen_address, now).await {
                warn!("Failed to update last seen for {}: {}", seen_address, e);
            }
        });

        self.emitter.emit_status(TelemetryEvent::ConnectionStatusChanged {
            address,
            status: LinkStatus::Connected,
        });
    }

    fn on_disconnect(&mut self, address: String, reply: oneshot::Sender<()>) {
        let teardown = self.connections.get_mut(&address).and_then(|connection| {
            match connection.subscription.as_mut() {
                Some(subscription)
                    if connection.state == ConnectionState::Connected
                        && !subscription.tearing_down =>
                {
                    subscription.tearing_down = true;
                    Some((subscription.generation, subscription.link.clone()))
                }
                _ => None,
            }
        });

        match teardown {
            Some((generation, link)) => {
                info!("Disconnecting {}", address);
                self.spawn_teardown(address, generation, link, Some(reply));
            }
            None => {
                info!("Disconnect requested for {}, which is not connected", address);
                let _ = reply.send(());
            }
        }
    }

    fn on_stop(&mut self, reply: oneshot::Sender<()>) {
        self.accepting = false;

        let mut live = Vec::new();
        for (address, connection) in self.connections.iter_mut() {
            if let Some(subscription) = connection.subscription.as_mut() {
                if !subscription.tearing_down {
                    subscription.tearing_down = true;
                    live.push((address.clone(), subscription.generation, subscription.link.clone()));
                }
            }
        }

        let teardowns: Vec<JoinHandle<()>> = live
            .into_iter()
            .map(|(address, generation, link)| self.spawn_teardown(address, generation, link, None))
            .collect();

        let commands = self.commands.clone();
        tokio::spawn(async move {
            for teardown in teardowns {
                let _ = teardown.await;
            }
            send_to(&commands, Command::StopComplete { reply });
        });
    }

    fn spawn_teardown(
        &self,
        address: String,
        generation: u64,
        link: Arc<dyn Link>,
        reply: Option<oneshot::Sender<()>>,
    ) -> JoinHandle<()> {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            // Best effort: the connection goes away whatever the radio says
            if let Err(e) = link.disconnect().await {
                warn!("Teardown of {} reported an error: {}", address, e);
            }
            send_to(
                &commands,
                Command::TeardownComplete {
                    address,
                    generation,
                    reply,
                },
            );
        })
    }

    /// Remove a connected entity; only the first caller per link gets through
    ///
    /// Returns the link when nobody is tearing it down yet.
    fn release(&mut self, address: &str, generation: u64) -> Option<Arc<dyn Link>> {
        let owns_link = self
            .connections
            .get(address)
            .and_then(|connection| connection.subscription.as_ref())
            .map_or(false, |subscription| subscription.generation == generation);
        if !owns_link {
            debug!("Link {} of {} already released", generation, address);
            return None;
        }

        let untorn = self
            .connections
            .remove(address)
            .and_then(|connection| connection.subscription)
            .and_then(|subscription| {
                subscription.forwarder.abort();
                (!subscription.tearing_down).then_some(subscription.link)
            });

        info!("{} disconnected", address);
        self.announce(address, ConnectionState::Disconnected, 0);
        self.emitter.emit_status(TelemetryEvent::ConnectionStatusChanged {
            address: address.to_string(),
            status: LinkStatus::Disconnected,
        });
        untorn
    }

    /// Destroy the entity of a device that is no longer paired
    fn forget(&mut self, address: &str) {
        let Some(connection) = self.connections.remove(address) else {
            return;
        };
        info!("{} is no longer paired", address);

        if let Some(pending) = connection.attempt {
            if let Some(reply) = pending.reply {
                let _ = reply.send(Err(ConnectError::NotPaired(address.to_string())));
            }
        }

        if let Some(subscription) = connection.subscription {
            subscription.forwarder.abort();
            let link = subscription.link;
            let teardown_address = address.to_string();
            tokio::spawn(async move {
                if let Err(e) = link.disconnect().await {
                    warn!("Teardown of {} reported an error: {}", teardown_address, e);
                }
            });
            self.emitter.emit_status(TelemetryEvent::ConnectionStatusChanged {
                address: address.to_string(),
                status: LinkStatus::Disconnected,
            });
        }
        self.announce(address, ConnectionState::Disconnected, 0);
    }

    /// A fresh scan session found an exhausted device: give it a new budget
    fn restore_budget(&mut self, address: &str) {
        let Some(connection) = self.connections.get_mut(address) else {
            return;
        };
        if connection.state == ConnectionState::Disconnected
            && connection.attempt_count >= self.config.max_attempts
        {
            info!("{} rediscovered, restoring its connection attempts", address);
            connection.attempt_count = 0;
        }
    }

    /// Drop the result of an attempt nobody is waiting for
    fn discard(&self, address: &str, outcome: Result<Established, ConnectError>) {
        if let Ok(established) = outcome {
            let address = address.to_string();
            tokio::spawn(async move {
                if let Err(e) = established.link.disconnect().await {
                    debug!("Failed to drop discarded link to {}: {}", address, e);
                }
            });
        }
    }

    fn announce(&self, address: &str, state: ConnectionState, attempt_count: u32) {
        debug!("{} -> {} ({} failed attempts)", address, state, attempt_count);
        // No listeners is fine
        let _ = self.transitions.send(StateTransition {
            address: address.to_string(),
            state,
            attempt_count,
        });
    }
}

async fn run_attempt(
    radio: Arc<dyn Radio>,
    handle: PeripheralHandle,
    profile: &'static GattProfile,
    connect_timeout: Duration,
    address: &str,
    attempt: u64,
    commands: &mpsc::WeakUnboundedSender<Command>,
) -> Result<Established, ConnectError> {
    let link: Arc<dyn Link> = match timeout(connect_timeout, radio.connect(&handle)).await {
        Err(_) => return Err(ConnectError::ConnectTimeout(connect_timeout)),
        Ok(Err(e)) => return Err(ConnectError::LinkRejected(e)),
        Ok(Ok(link)) => Arc::from(link),
    };

    send_to(
        commands,
        Command::Progress {
            address: address.to_string(),
            attempt,
            state: ConnectionState::Discovering,
        },
    );

    match establish(link.as_ref(), profile, address, attempt, commands).await {
        Ok((notifications, disconnected)) => Ok(Established {
            link,
            service: profile.service,
            characteristic: profile.characteristic,
            notifications,
            disconnected,
        }),
        Err(e) => {
            if let Err(teardown) = link.disconnect().await {
                debug!("Failed to drop half-open link to {}: {}", address, teardown);
            }
            Err(e)
        }
    }
}

/// Discover the profile's service and characteristic, then subscribe
async fn establish(
    link: &dyn Link,
    profile: &'static GattProfile,
    address: &str,
    attempt: u64,
    commands: &mpsc::WeakUnboundedSender<Command>,
) -> Result<(BoxStream<'static, Vec<u8>>, BoxFuture<'static, ()>), ConnectError> {
    let service = link
        .discover_services(&[profile.service])
        .await
        .map_err(ConnectError::DiscoveryFailed)?
        .into_iter()
        .find(|service| service.uuid == profile.service)
        .ok_or(ConnectError::ServiceNotFound(profile.service))?;

    let characteristic = link
        .discover_characteristics(&service, &[profile.characteristic])
        .await
        .map_err(ConnectError::DiscoveryFailed)?
        .into_iter()
        .find(|characteristic| characteristic.uuid == profile.characteristic)
        .ok_or(ConnectError::CharacteristicNotFound(profile.characteristic))?;

    send_to(
        commands,
        Command::Progress {
            address: address.to_string(),
            attempt,
            state: ConnectionState::Subscribing,
        },
    );

    debug!("Subscribing to {} measurements of {}", profile.kind, address);
    let notifications = link
        .subscribe(&characteristic)
        .await
        .map_err(ConnectError::SubscribeFailed)?;
    let disconnected = link
        .on_disconnect()
        .await
        .map_err(ConnectError::SubscribeFailed)?;

    Ok((notifications, disconnected))
}

/// Pump notifications into the pipeline until the link drops
#[allow(clippy::too_many_arguments)]
async fn forward_notifications(
    address: String,
    service: Uuid,
    characteristic: Uuid,
    mut notifications: BoxStream<'static, Vec<u8>>,
    mut disconnected: BoxFuture<'static, ()>,
    pipeline: ReadingPipeline,
    commands: mpsc::WeakUnboundedSender<Command>,
    generation: u64,
) {
    let link_down = loop {
        tokio::select! {
            payload = notifications.next() => match payload {
                Some(payload) => pipeline.submit(RawNotification {
                    device_address: address.clone(),
                    service_id: service,
                    characteristic_id: characteristic,
                    payload,
                }),
                None => {
                    // The link itself may still be up
                    debug!("Notification stream of {} ended", address);
                    break false;
                }
            },
            _ = &mut disconnected => {
                debug!("Link to {} dropped", address);
                break true;
            }
        }
    };

    send_to(
        &commands,
        Command::LinkLost {
            address,
            generation,
            link_down,
        },
    );
}
