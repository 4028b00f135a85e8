//! Device orchestrator
//!
//! A [`Device`] owns one transport and everything the protocol needs to talk
//! over it: the framer, the single-flight command queue, the response
//! reassembler and the sensor registry. Two background tasks run while the
//! device is open:
//!
//! - the receive task turns transport chunks into complete responses and
//!   dispatches them (measurements to sensors, everything else to the queue)
//! - the tick task expires timed-out commands and writes the queue head
//!
//! All protocol state sits behind one synchronous mutex that is never held
//! across an `.await`. Events raised while it is held are queued and
//! delivered after the guard is dropped, so listeners may read the
//! [`Device`] they observe.

use crate::config::EngineConfig;
use crate::core::diagnostics::{DiagnosticSink, Direction, Severity, TracingSink};
use crate::core::events::{Dispatch, EventHub, ListenerId};
use crate::core::protocol::checksum;
use crate::core::protocol::command::Command;
use crate::core::protocol::framing::{self, Framer, MEASUREMENT_RESPONSE};
use crate::core::protocol::measurement::{self, Measurement};
use crate::core::protocol::reassembly::{Progress, Reassembler};
use crate::core::protocol::response::{
    self, Ack, ChargingState, DeviceIdentity, DeviceStatus, ResponseError,
};
use crate::core::queue::{CommandError, CommandQueue};
use crate::core::sensor::{SensorError, SensorEvent, SensorRegistry, SensorSnapshot, Transition};
use crate::core::state_machine::{DeviceState, DeviceStateMachine, StateError, StateTransition};
use crate::core::transport::{TransportError, TransportEvent, TransportTrait};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type SharedTransport = Arc<AsyncMutex<Box<dyn TransportTrait>>>;

/// Device errors
#[derive(Error, Debug)]
pub enum DeviceError {
    /// `open` called on a device that is not closed
    #[error("Device already open")]
    AlreadyOpen,

    /// Operation needs an open device
    #[error("Device not open")]
    NotOpen,

    /// No sensor on this channel
    #[error("Unknown sensor channel: {0}")]
    UnknownChannel(u8),

    /// Sensor registry rejected a descriptor
    #[error("Sensor error: {0}")]
    Sensor(SensorError),

    /// A command failed
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    /// The transport failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A response payload did not match its layout
    #[error("Malformed response: {0}")]
    MalformedResponse(#[from] ResponseError),

    /// Lifecycle violation
    #[error("State error: {0}")]
    State(#[from] StateError),
}

impl From<SensorError> for DeviceError {
    fn from(error: SensorError) -> Self {
        match error {
            SensorError::UnknownChannel(channel) => Self::UnknownChannel(channel),
            other => Self::Sensor(other),
        }
    }
}

/// Device lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEvent {
    /// The open sequence completed
    Opened,
    /// The session ended (close or link loss)
    Closed,
    /// The device accepted a start request
    CollectionStarted,
    /// The device accepted a stop request
    CollectionStopped,
}

/// Protocol state of one device
struct DeviceShared {
    framer: Framer,
    queue: CommandQueue,
    reassembler: Reassembler,
    sensors: SensorRegistry,
    state: DeviceStateMachine,
    collecting: bool,
    default_mask: u32,
    status: Option<DeviceStatus>,
    identity: Option<DeviceIdentity>,
    events: EventHub<DeviceEvent>,
    outbox: Vec<Dispatch<DeviceEvent>>,
}

impl DeviceShared {
    fn new(config: &EngineConfig) -> Self {
        Self {
            framer: Framer::new(),
            queue: CommandQueue::new(config.command_timeout()),
            reassembler: Reassembler::new(config.reassembly_timeout()),
            sensors: SensorRegistry::new(config.keep_values, config.event_capacity),
            state: DeviceStateMachine::new(),
            collecting: false,
            default_mask: 0,
            status: None,
            identity: None,
            events: EventHub::new(config.event_capacity),
            outbox: Vec::new(),
        }
    }

    /// Queue a lifecycle event for delivery after unlock
    fn emit(&mut self, event: DeviceEvent) {
        let dispatch = self.events.prepare(event);
        self.outbox.push(dispatch);
    }

    fn take_events(&mut self) -> Events {
        Events {
            sensor: self.sensors.take_dispatches(),
            device: std::mem::take(&mut self.outbox),
        }
    }
}

/// Events taken out of the locked state
struct Events {
    sensor: Vec<Dispatch<SensorEvent>>,
    device: Vec<Dispatch<DeviceEvent>>,
}

impl Events {
    fn deliver(self) {
        for dispatch in self.sensor {
            dispatch.deliver();
        }
        for dispatch in self.device {
            dispatch.deliver();
        }
    }
}

/// Handles shared with the background tasks
#[derive(Clone)]
struct Io {
    shared: Arc<Mutex<DeviceShared>>,
    transport: SharedTransport,
    diagnostics: Arc<dyn DiagnosticSink>,
    max_packet_len: Option<usize>,
    tasks: Arc<Mutex<Option<IoTasks>>>,
}

struct IoTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Io {
    fn log(&self, severity: Severity, message: &str) {
        self.diagnostics.record(severity, message);
    }

    /// Run `f` on the locked state, then deliver the events it raised unlocked
    fn with_shared<R>(&self, f: impl FnOnce(&mut DeviceShared) -> R) -> R {
        let (result, events) = {
            let mut shared = self.shared.lock();
            let result = f(&mut *shared);
            (result, shared.take_events())
        };
        events.deliver();
        result
    }

    /// Frame, enqueue and await one command
    async fn request(&self, command: Command) -> Result<Bytes, DeviceError> {
        let reply = {
            let mut shared = self.shared.lock();
            let frame = shared.framer.frame(&command).map_err(CommandError::from)?;
            self.log(
                Severity::Debug,
                &format!(
                    "queue {} (0x{:02X}) seq 0x{:02X}",
                    command.name(),
                    frame.command,
                    frame.sequence
                ),
            );
            shared.queue.enqueue(frame)?
        };

        match reply.await {
            Ok(result) => Ok(result?),
            // Queue dropped without answering: the device was torn down
            Err(_) => Err(CommandError::Disconnected.into()),
        }
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<(), TransportError> {
        let mut transport = self.transport.lock().await;
        let max_len = self.max_packet_len.unwrap_or_else(|| transport.max_packet_len());
        for chunk in framing::chunks(packet, max_len) {
            transport.write(chunk).await?;
        }
        Ok(())
    }

    /// Expire, discard stalled input, then write the head if nothing is in flight
    async fn tick(&self) {
        let now = Instant::now();
        let frame = {
            let mut shared = self.shared.lock();
            for (command, sequence) in shared.queue.expire(now) {
                self.log(
                    Severity::Warn,
                    &format!("command 0x{:02X} seq 0x{:02X} timed out", command, sequence),
                );
            }
            if let Some(discarded) = shared.reassembler.discard_if_stalled(now) {
                self.log(
                    Severity::Warn,
                    &format!("discarded stalled partial response ({} bytes)", discarded),
                );
            }
            shared.queue.poll_send(now)
        };

        let Some(frame) = frame else {
            return;
        };
        self.diagnostics.packet(Direction::Sent, &frame.bytes);
        if let Err(e) = self.write_packet(&frame.bytes).await {
            self.log(
                Severity::Error,
                &format!("write of command 0x{:02X} failed: {}", frame.command, e),
            );
            self.shared.lock().queue.fail(
                frame.command,
                frame.sequence,
                CommandError::Transport(e.to_string()),
            );
        }
    }

    async fn tick_loop(self, interval: std::time::Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    async fn receive_loop(
        self,
        mut rx: broadcast::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = rx.recv() => event,
            };
            match event {
                Ok(TransportEvent::Data(chunk)) => self.on_chunk(&chunk),
                Ok(TransportEvent::Disconnected) | Err(RecvError::Closed) => {
                    self.link_lost();
                    break;
                }
                Err(RecvError::Lagged(skipped)) => {
                    self.log(
                        Severity::Warn,
                        &format!("receive lagged, {} chunks lost", skipped),
                    );
                    self.shared.lock().reassembler.reset();
                }
            }
        }
    }

    fn on_chunk(&self, chunk: &[u8]) {
        self.diagnostics.packet(Direction::Received, chunk);
        self.with_shared(|shared| self.handle_chunk(shared, chunk));
    }

    fn handle_chunk(&self, shared: &mut DeviceShared, chunk: &[u8]) {
        let now = Instant::now();
        if let Some(discarded) = shared.reassembler.discard_if_stalled(now) {
            self.log(
                Severity::Warn,
                &format!("discarded stalled partial response ({} bytes)", discarded),
            );
        }
        let response = match shared.reassembler.push(chunk, now) {
            Progress::Complete(response) => response,
            Progress::Incomplete { .. } => return,
        };
        if !checksum::verify(&response) {
            self.log(
                Severity::Debug,
                &format!("checksum mismatch in response {}", hex::encode(&response)),
            );
        }

        if framing::response_type(&response) == Some(MEASUREMENT_RESPONSE) {
            self.dispatch_measurement(shared, &response);
            return;
        }

        let Some((command, sequence)) = framing::response_key(&response) else {
            self.log(
                Severity::Warn,
                &format!("response too short to correlate: {}", hex::encode(&response)),
            );
            return;
        };
        let start = framing::RESPONSE_PAYLOAD_OFFSET.min(response.len());
        if !shared.queue.resolve(command, sequence, response.slice(start..)) {
            self.log(
                Severity::Warn,
                &format!("unmatched response 0x{:02X}/0x{:02X}", command, sequence),
            );
        }
    }

    fn dispatch_measurement(&self, shared: &mut DeviceShared, response: &[u8]) {
        match measurement::decode(response, shared.sensors.registered_mask()) {
            Measurement::Samples {
                kind,
                values,
                truncated,
            } => {
                if truncated {
                    self.log(
                        Severity::Warn,
                        &format!("{:?} notification truncated after {} values", kind, values.len()),
                    );
                }
                shared.sensors.apply(&values);
            }
            Measurement::Informational(kind) => {
                self.log(Severity::Debug, &format!("{:?} notification", kind));
            }
            Measurement::Unrecognized(code) => {
                self.log(
                    Severity::Debug,
                    &format!("unrecognized measurement type 0x{:02X}", code),
                );
            }
            Measurement::Malformed { kind, len } => {
                self.log(
                    Severity::Warn,
                    &format!("malformed {:?} notification ({} bytes)", kind, len),
                );
            }
        }
    }

    fn link_lost(&self) {
        // Both loops exit on the token; dropping the handles detaches them
        if let Some(tasks) = self.tasks.lock().take() {
            tasks.cancel.cancel();
        }
        self.with_shared(|shared| {
            let failed = shared.queue.fail_all(CommandError::Disconnected);
            shared.reassembler.reset();
            shared.collecting = false;
            let was_open = shared.state.state() != DeviceState::Closed;
            shared.state.force_closed("link lost");
            self.log(
                Severity::Warn,
                &format!("link lost, {} pending commands failed", failed),
            );
            if was_open {
                shared.emit(DeviceEvent::Closed);
            }
        });
    }
}

/// One sensor interface
pub struct Device {
    id: Uuid,
    config: EngineConfig,
    io: Io,
}

impl Device {
    /// Create a device that logs through `tracing`
    pub fn new<T: TransportTrait + 'static>(transport: T, config: EngineConfig) -> Self {
        let id = Uuid::new_v4();
        let sink = TracingSink::for_device(id.to_string());
        Self::build(id, Box::new(transport), config, Arc::new(sink))
    }

    /// Create a device with a custom diagnostic sink
    pub fn with_diagnostics<T: TransportTrait + 'static>(
        transport: T,
        config: EngineConfig,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self::build(Uuid::new_v4(), Box::new(transport), config, diagnostics)
    }

    fn build(
        id: Uuid,
        transport: Box<dyn TransportTrait>,
        config: EngineConfig,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let io = Io {
            shared: Arc::new(Mutex::new(DeviceShared::new(&config))),
            transport: Arc::new(AsyncMutex::new(transport)),
            diagnostics,
            max_packet_len: config.max_packet_len,
            tasks: Arc::new(Mutex::new(None)),
        };
        Self { id, config, io }
    }

    /// Unique id of this device instance
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<(), DeviceError> {
        if self.io.shared.lock().state.state().is_open() {
            Ok(())
        } else {
            Err(DeviceError::NotOpen)
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Open the session: connect, initialize, read status and enumerate sensors.
    ///
    /// Any failure tears the transport down and leaves the device closed.
    /// With `auto_start`, collection starts once the device is open; a failed
    /// start is returned but the device stays open.
    pub async fn open(&self, auto_start: bool) -> Result<(), DeviceError> {
        {
            let mut shared = self.io.shared.lock();
            if shared.state.state() != DeviceState::Closed {
                return Err(DeviceError::AlreadyOpen);
            }
            shared.state.transition(DeviceState::Connecting, Some("open"))?;
        }

        if let Err(e) = self.open_sequence().await {
            self.io.log(Severity::Error, &format!("open failed: {}", e));
            self.teardown("open failed").await;
            return Err(e);
        }

        if auto_start {
            self.start(None).await?;
        }
        Ok(())
    }

    async fn open_sequence(&self) -> Result<(), DeviceError> {
        let (rx, info) = {
            let mut transport = self.io.transport.lock().await;
            let rx = transport.subscribe();
            transport.connect().await?;
            (rx, transport.connection_info())
        };
        self.io.log(Severity::Info, &format!("connected to {}", info));

        {
            let mut shared = self.io.shared.lock();
            shared.framer.reset();
            shared.reassembler.reset();
            shared.queue.reopen();
            shared.sensors.clear();
            shared.collecting = false;
            shared.state.transition(DeviceState::Initializing, None)?;
        }
        self.spawn_io(rx).await;

        self.io.request(Command::init()).await?;
        let status = DeviceStatus::parse(&self.io.request(Command::status()).await?)?;
        let default_mask = response::parse_mask(&self.io.request(Command::default_sensors_mask()).await?)?;
        let available = response::parse_mask(&self.io.request(Command::sensor_ids()).await?)?;

        let mut specs = Vec::new();
        for channel in measurement::channels_in_mask(available, u32::MAX) {
            let payload = self.io.request(Command::sensor_info(channel)).await?;
            match response::parse_sensor_info(&payload)? {
                Some(mut spec) => {
                    if spec.channel != channel {
                        self.io.log(
                            Severity::Debug,
                            &format!("sensor info for channel {} reports channel {}", channel, spec.channel),
                        );
                        spec.channel = channel;
                    }
                    specs.push(spec);
                }
                None => self.io.log(
                    Severity::Debug,
                    &format!("channel {} has no sensor, skipped", channel),
                ),
            }
        }

        let identity = DeviceIdentity::parse(&self.io.request(Command::device_info()).await?)?;

        self.io.with_shared(|shared| -> Result<(), DeviceError> {
            for spec in specs {
                let channel = spec.channel;
                if let Err(e) = shared.sensors.insert(spec) {
                    self.io.log(Severity::Debug, &format!("sensor {} skipped: {}", channel, e));
                }
            }
            shared.default_mask = default_mask;
            shared.status = Some(status);
            shared.state.transition(DeviceState::Open, None)?;
            self.io.log(
                Severity::Info,
                &format!(
                    "opened {} ({}), {} sensors, battery {}%",
                    identity.name,
                    identity.serial_number,
                    shared.sensors.len(),
                    status.battery_percent
                ),
            );
            shared.identity = Some(identity);
            shared.emit(DeviceEvent::Opened);
            Ok(())
        })
    }

    async fn spawn_io(&self, rx: broadcast::Receiver<TransportEvent>) {
        self.stop_io().await;
        let cancel = CancellationToken::new();
        let handles = vec![
            tokio::spawn(self.io.clone().receive_loop(rx, cancel.clone())),
            tokio::spawn(
                self.io
                    .clone()
                    .tick_loop(self.config.tick_interval(), cancel.clone()),
            ),
        ];
        *self.io.tasks.lock() = Some(IoTasks { cancel, handles });
    }

    async fn stop_io(&self) {
        let tasks = self.io.tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.cancel.cancel();
            for handle in tasks.handles {
                // A panicked task has nothing left to clean up
                let _ = handle.await;
            }
        }
    }

    async fn teardown(&self, reason: &str) {
        self.stop_io().await;

        let was_open = self.io.with_shared(|shared| {
            shared.queue.fail_all(CommandError::Disconnected);
            shared.reassembler.reset();
            shared.collecting = false;
            let was_open = matches!(
                shared.state.state(),
                DeviceState::Open | DeviceState::Collecting | DeviceState::Closing
            );
            shared.state.force_closed(reason);
            was_open
        });

        if let Err(e) = self.io.transport.lock().await.disconnect().await {
            self.io.log(Severity::Warn, &format!("transport disconnect failed: {}", e));
        }
        if was_open {
            self.io.with_shared(|shared| shared.emit(DeviceEvent::Closed));
        }
    }

    /// Close the session: stop collection, send DISCONNECT, release the transport
    pub async fn close(&self) -> Result<(), DeviceError> {
        let collecting = {
            let shared = self.io.shared.lock();
            if !shared.state.state().is_open() {
                return Err(DeviceError::NotOpen);
            }
            shared.collecting
        };

        if collecting {
            if let Err(e) = self.stop().await {
                self.io.log(Severity::Warn, &format!("stop before close failed: {}", e));
            }
        }

        self.io
            .shared
            .lock()
            .state
            .transition(DeviceState::Closing, Some("close"))?;
        if let Err(e) = self.io.request(Command::disconnect()).await {
            self.io.log(Severity::Debug, &format!("disconnect not acknowledged: {}", e));
        }

        self.teardown("closed").await;
        self.io.log(Severity::Info, "closed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// Start collecting.
    ///
    /// Enables the default sensors when none is enabled, clears retained
    /// values and applies `period_ms` (or the configured default) before
    /// sending the period and start commands.
    pub async fn start(&self, period_ms: Option<f64>) -> Result<Ack, DeviceError> {
        let (period, mask) = self.io.with_shared(|shared| {
            if !shared.state.state().is_open() {
                return Err(DeviceError::NotOpen);
            }
            if shared.sensors.enabled_mask() == 0 {
                let defaults = shared.default_mask;
                shared.sensors.enable_mask(defaults);
            }
            shared.sensors.clear_enabled_history();
            if let Some(period) = period_ms.or(self.config.default_period_ms) {
                shared.sensors.set_measurement_period(period);
            }
            Ok((shared.sensors.measurement_period(), shared.sensors.enabled_mask()))
        })?;

        self.io.request(Command::set_measurement_period(period)).await?;
        let ack = Ack::parse(&self.io.request(Command::start_measurements(mask)).await?)?;

        match ack {
            Ack::Accepted => {
                self.io.with_shared(|shared| {
                    shared.state.transition(DeviceState::Collecting, None)?;
                    shared.collecting = true;
                    self.io.log(
                        Severity::Info,
                        &format!("collecting mask 0x{:08X} every {} ms", mask, period),
                    );
                    shared.emit(DeviceEvent::CollectionStarted);
                    Ok::<_, DeviceError>(())
                })?;
            }
            Ack::Refused(code) => {
                self.io.log(Severity::Warn, &format!("start refused with status {}", code));
            }
        }
        Ok(ack)
    }

    /// Stop collecting
    pub async fn stop(&self) -> Result<Ack, DeviceError> {
        self.ensure_open()?;
        let ack = Ack::parse(&self.io.request(Command::stop_measurements()).await?)?;

        match ack {
            Ack::Accepted => {
                self.io.with_shared(|shared| {
                    let was_collecting = std::mem::replace(&mut shared.collecting, false);
                    if shared.state.state() == DeviceState::Collecting {
                        shared.state.transition(DeviceState::Open, None)?;
                    }
                    if was_collecting {
                        shared.emit(DeviceEvent::CollectionStopped);
                    }
                    Ok::<_, DeviceError>(())
                })?;
            }
            Ack::Refused(code) => {
                self.io.log(Severity::Warn, &format!("stop refused with status {}", code));
            }
        }
        Ok(ack)
    }

    /// Enable or disable a sensor.
    ///
    /// Enabling applies mutual exclusion and recomputes the measurement
    /// period. While collecting, any change restarts collection with the new
    /// channel mask; restart failures are logged, not returned.
    pub async fn set_sensor_enabled(&self, channel: u8, enabled: bool) -> Result<Transition, DeviceError> {
        let (transition, collecting, any_enabled) = self.io.with_shared(|shared| {
            let transition = shared.sensors.set_enabled(channel, enabled)?;
            Ok::<_, DeviceError>((transition, shared.collecting, shared.sensors.enabled_mask() != 0))
        })?;

        for disabled in &transition.disabled {
            self.io.log(
                Severity::Debug,
                &format!("sensor {} disabled, excluded by sensor {}", disabled, channel),
            );
        }

        if transition.changed && collecting {
            if let Err(e) = self.restart(any_enabled, transition.period_ms).await {
                self.io.log(Severity::Warn, &format!("restart after sensor change failed: {}", e));
            }
        }
        Ok(transition)
    }

    async fn restart(&self, any_enabled: bool, period_ms: f64) -> Result<(), DeviceError> {
        self.stop().await?;
        if any_enabled {
            self.start(Some(period_ms)).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commands and status
    // ------------------------------------------------------------------

    /// Send a raw command and return its response payload
    pub async fn send_command(&self, code: u8, payload: &[u8]) -> Result<Bytes, DeviceError> {
        self.ensure_open()?;
        self.io.request(Command::raw(code, payload)).await
    }

    /// Query status again and store it
    pub async fn refresh_status(&self) -> Result<DeviceStatus, DeviceError> {
        self.ensure_open()?;
        let status = DeviceStatus::parse(&self.io.request(Command::status()).await?)?;
        self.io.shared.lock().status = Some(status);
        Ok(status)
    }

    /// Last known status
    pub fn status(&self) -> Option<DeviceStatus> {
        self.io.shared.lock().status
    }

    /// Last known battery level in percent
    pub fn battery_level(&self) -> Option<u8> {
        self.status().map(|s| s.battery_percent)
    }

    /// Last known charger state
    pub fn charging_state(&self) -> Option<ChargingState> {
        self.status().map(|s| s.charging_state)
    }

    /// Identity strings read at open
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.io.shared.lock().identity.clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> DeviceState {
        self.io.shared.lock().state.state()
    }

    /// Recorded lifecycle transitions
    pub fn state_history(&self) -> Vec<StateTransition> {
        self.io.shared.lock().state.history().to_vec()
    }

    /// Whether the device is collecting
    pub fn is_collecting(&self) -> bool {
        self.io.shared.lock().collecting
    }

    /// Current measurement period (ms)
    pub fn measurement_period(&self) -> f64 {
        self.io.shared.lock().sensors.measurement_period()
    }

    /// Sensors the device enables by default
    pub fn default_sensors_mask(&self) -> u32 {
        self.io.shared.lock().default_mask
    }

    /// Number of commands waiting in the queue
    pub fn pending_commands(&self) -> usize {
        self.io.shared.lock().queue.len()
    }

    // ------------------------------------------------------------------
    // Sensors and events
    // ------------------------------------------------------------------

    /// Snapshots of every sensor, in discovery order
    pub fn sensors(&self) -> Vec<SensorSnapshot> {
        self.io.shared.lock().sensors.iter().map(|s| s.snapshot()).collect()
    }

    /// Snapshot of one sensor
    pub fn sensor(&self, channel: u8) -> Option<SensorSnapshot> {
        self.io.shared.lock().sensors.get(channel).map(|s| s.snapshot())
    }

    /// Toggle whether decoded values are kept in sensor history
    pub fn set_keep_values(&self, keep: bool) {
        self.io.shared.lock().sensors.set_keep_values(keep);
    }

    /// Listen to one sensor.
    ///
    /// Sensors are rebuilt on every open, so listeners must be registered
    /// after `open`. Value listeners run on the receive task.
    pub fn on_sensor_event<F>(&self, channel: u8, listener: F) -> Result<ListenerId, DeviceError>
    where
        F: Fn(&SensorEvent) + Send + Sync + 'static,
    {
        Ok(self.io.shared.lock().sensors.listen(channel, listener)?)
    }

    /// Remove a sensor listener
    pub fn remove_sensor_listener(&self, channel: u8, id: ListenerId) -> Result<bool, DeviceError> {
        Ok(self.io.shared.lock().sensors.unlisten(channel, id)?)
    }

    /// Subscribe to one sensor's events
    pub fn subscribe_sensor(&self, channel: u8) -> Result<broadcast::Receiver<SensorEvent>, DeviceError> {
        self.io
            .shared
            .lock()
            .sensors
            .get(channel)
            .map(|s| s.subscribe())
            .ok_or(DeviceError::UnknownChannel(channel))
    }

    /// Listen to lifecycle events
    pub fn on_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        self.io.shared.lock().events.listen(listener)
    }

    /// Remove a lifecycle listener
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.io.shared.lock().events.unlisten(id)
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.io.shared.lock().events.subscribe()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Some(tasks) = self.io.tasks.lock().take() {
            tasks.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diagnostics::MemorySink;
    use crate::core::simulator::VirtualDevice;
    use crate::core::transport::MockTransportTrait;

    fn config() -> EngineConfig {
        EngineConfig {
            max_packet_len: Some(63),
            ..EngineConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_leaves_device_closed() {
        let (tx, _) = broadcast::channel(8);
        let mut mock = MockTransportTrait::new();
        mock.expect_subscribe().returning(move || tx.subscribe());
        mock.expect_connect()
            .returning(|| Err(TransportError::ConnectionFailed("no device".into())));
        mock.expect_disconnect().returning(|| Ok(()));

        let device = Device::new(mock, config());
        let err = device.open(false).await.unwrap_err();

        assert!(matches!(err, DeviceError::Transport(TransportError::ConnectionFailed(_))));
        assert_eq!(device.state(), DeviceState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_fails_open() {
        let (tx, _) = broadcast::channel(8);
        let sender = tx.clone();
        let mut mock = MockTransportTrait::new();
        mock.expect_subscribe().returning(move || sender.subscribe());
        mock.expect_connect().returning(|| Ok(()));
        mock.expect_connection_info().returning(|| "mock".to_string());
        mock.expect_write()
            .returning(|_| Err(TransportError::SendError("pipe closed".into())));
        mock.expect_disconnect().times(1).returning(|| Ok(()));

        let sink = Arc::new(MemorySink::default());
        let device = Device::with_diagnostics(mock, config(), sink.clone());
        let err = device.open(false).await.unwrap_err();

        assert!(matches!(err, DeviceError::Command(CommandError::Transport(_))));
        assert_eq!(device.state(), DeviceState::Closed);
        assert!(sink.contains(Severity::Error, "write of command 0x1A failed"));
        assert_eq!(device.pending_commands(), 0);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_releases_io_tasks() {
        let virtual_device = VirtualDevice::default();
        let handle = virtual_device.handle();
        let device = Device::new(virtual_device, config());
        device.open(false).await.unwrap();
        assert!(device.io.tasks.lock().is_some());

        handle.drop_link();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(device.io.tasks.lock().is_none());
        assert!(device.io.shared.lock().queue.is_closed());
        assert_eq!(device.state(), DeviceState::Closed);

        // Reopening starts fresh tasks on a reopened queue
        device.open(false).await.unwrap();
        assert!(device.io.tasks.lock().is_some());
        assert!(!device.io.shared.lock().queue.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_need_open_device() {
        let mock = MockTransportTrait::new();
        let device = Device::new(mock, config());

        assert!(matches!(device.close().await, Err(DeviceError::NotOpen)));
        assert!(matches!(device.start(None).await, Err(DeviceError::NotOpen)));
        assert!(matches!(device.stop().await, Err(DeviceError::NotOpen)));
        assert!(matches!(device.send_command(0x10, &[]).await, Err(DeviceError::NotOpen)));
        assert!(matches!(
            device.set_sensor_enabled(0, true).await,
            Err(DeviceError::UnknownChannel(0))
        ));
        assert!(device.sensors().is_empty());
        assert_eq!(device.battery_level(), None);
    }
}
