//! Event stream coordinator.
//!
//! A single task owns the hardware session, the peripheral registry and the
//! event bus. Callers talk to it over a command channel; hardware callbacks
//! reach it over a second channel, so session mutations and event publishing
//! are never interleaved. Awaitable operations subscribe to the bus before
//! their request is issued and resolve on the first matching event, or on
//! `BleError::Finished` when the session is torn down first.

use futures::{future, stream::BoxStream, Stream, StreamExt};
use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use super::advertisement::Advertisement;
use super::event_bus::{EventBus, ListenerScope};
use super::hardware::{
    CentralSession, CentralStack, CharacteristicId, Delegate, DelegateEvent,
    RadioState, ScanFilter, SessionEvent, SessionId, SessionOptions,
};
use super::peripheral::PeripheralHandle;
use super::registry::PeripheralRegistry;
use crate::error::{BleError, Result};

pub type EventStream = UnboundedReceiverStream<DelegateEvent>;

type Responder<T> = oneshot::Sender<T>;

#[derive(Debug)]
enum PeripheralRequest {
    Connect,
    CancelConnection,
    DiscoverServices(Option<Vec<Uuid>>),
    DiscoverCharacteristics { service: Uuid, filter: Option<Vec<Uuid>> },
    ReadValue(CharacteristicId),
}

enum CoordinatorCmd {
    Enable { resp: Responder<Result<RadioState>> },
    Disable { resp: Responder<()> },
    Subscribe { resp: Responder<EventStream> },
    Scan { filter: ScanFilter, resp: Responder<EventStream> },
    StopScanning { resp: Responder<()> },
    DiscoveredPeripheral { id: Uuid, resp: Responder<Option<PeripheralHandle>> },
    Request {
        id: Uuid,
        request: PeripheralRequest,
        resp: Responder<std::result::Result<EventStream, BleError>>,
    },
}

/// Resolves to the first value `project` produces for an event concerning
/// `target`, or to `finished` when the stream ends without one.
pub async fn first_match<T, S, F>(
    events: S, target: Option<Uuid>, finished: T, mut project: F,
) -> T
where
    S: Stream<Item = DelegateEvent> + Unpin,
    F: FnMut(DelegateEvent) -> Option<T>,
{
    let mut events = events;
    while let Some(event) = events.next().await {
        if !event.concerns(target) {
            continue;
        }
        if let Some(value) = project(event) {
            return value;
        }
    }
    finished
}

async fn first_result<T, S, F>(
    events: S, target: Option<Uuid>, project: F,
) -> std::result::Result<T, BleError>
where
    S: Stream<Item = DelegateEvent> + Unpin,
    F: FnMut(DelegateEvent) -> Option<std::result::Result<T, BleError>>,
{
    first_match(events, target, Err(BleError::Finished), project).await
}

struct ActiveSession {
    id: SessionId,
    central: Box<dyn CentralSession>,
    delegate: Delegate,
}

struct CoordinatorState<S> {
    stack: S,
    options: SessionOptions,
    session: Option<ActiveSession>,
    last_session_id: SessionId,
    registry: PeripheralRegistry,
    bus: EventBus<DelegateEvent>,
    hw_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl<S: CentralStack> CoordinatorState<S> {
    fn reset(&mut self) {
        if let Some(mut session) = self.session.take() {
            info!("Tearing down hardware session {}", session.id);
            session.central.stop_scan();
            session.central.close();
        }
        self.registry.clear();
        self.bus.close();
    }

    fn enable(&mut self) -> Result<RadioState> {
        self.reset();

        self.last_session_id += 1;
        let id = self.last_session_id;
        let delegate = Delegate::new(id, self.hw_tx.clone());
        let central = self.stack.open_session(delegate.clone(), &self.options)?;
        let state = central.radio_state();

        info!("Hardware session {} created, radio is {}", id, state);
        self.bus = EventBus::new();
        self.session = Some(ActiveSession { id, central, delegate });

        Ok(state)
    }

    fn scan(&mut self, filter: ScanFilter) -> EventStream {
        self.bus.close_scope(ListenerScope::Scan);
        let events = self.bus.subscribe(ListenerScope::Scan);

        let Some(session) = self.session.as_mut() else {
            warn!("Scan requested without an enabled session");
            return events;
        };

        session.central.stop_scan();
        if let Err(e) = session.central.scan(&filter) {
            error!("Error starting scan: {:?}", e);
            self.bus.close_scope(ListenerScope::Scan);
        } else {
            debug!("Scanning with filter {:?}", filter);
        }
        events
    }

    fn stop_scanning(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.central.stop_scan();
        }
        self.bus.close_scope(ListenerScope::Scan);
    }

    fn request(
        &mut self, id: Uuid, request: PeripheralRequest,
    ) -> std::result::Result<EventStream, BleError> {
        let Some(session) = self.session.as_mut() else {
            debug_assert!(self.bus.is_closed());
            //the bus is finished, the caller resolves to Finished
            return Ok(self.bus.subscribe(ListenerScope::Session));
        };

        let peripheral = self
            .registry
            .get(&id)
            .cloned()
            .ok_or(BleError::UnknownPeripheral(id))?;

        let events = self.bus.subscribe(ListenerScope::Session);

        debug!("Issuing {:?} for peripheral {}", request, id);
        let central = &mut session.central;
        let issued = match request {
            PeripheralRequest::Connect => central.connect(&peripheral),
            PeripheralRequest::CancelConnection => {
                central.cancel_connection(&peripheral)
            }
            PeripheralRequest::DiscoverServices(services) => {
                central.discover_services(&peripheral, services)
            }
            PeripheralRequest::DiscoverCharacteristics { service, filter } => {
                central.discover_characteristics(&peripheral, service, filter)
            }
            PeripheralRequest::ReadValue(characteristic) => {
                central.read_value(&peripheral, characteristic)
            }
        };

        match issued {
            Ok(()) => Ok(events),
            Err(e) => {
                error!("Hardware rejected request for {}: {:?}", id, e);
                Err(BleError::CausedBy(e.into()))
            }
        }
    }

    fn handle_cmd(&mut self, cmd: CoordinatorCmd) {
        match cmd {
            CoordinatorCmd::Enable { resp } => {
                let _ = resp.send(self.enable());
            }
            CoordinatorCmd::Disable { resp } => {
                self.reset();
                let _ = resp.send(());
            }
            CoordinatorCmd::Subscribe { resp } => {
                let _ = resp.send(self.bus.subscribe(ListenerScope::Session));
            }
            CoordinatorCmd::Scan { filter, resp } => {
                let _ = resp.send(self.scan(filter));
            }
            CoordinatorCmd::StopScanning { resp } => {
                self.stop_scanning();
                let _ = resp.send(());
            }
            CoordinatorCmd::DiscoveredPeripheral { id, resp } => {
                let _ = resp.send(self.registry.get(&id).cloned());
            }
            CoordinatorCmd::Request { id, request, resp } => {
                let _ = resp.send(self.request(id, request));
            }
        }
    }

    fn handle_hardware_event(&mut self, SessionEvent { session, event }: SessionEvent) {
        let Some(active) = self.session.as_ref() else {
            trace!("Dropping event from session {} while disabled", session);
            return;
        };
        if active.id != session {
            trace!("Dropping event from stale session {}", session);
            return;
        }

        if let Some(peripheral) = event.peripheral() {
            if self.registry.register(peripheral, &active.delegate) {
                trace!("{} peripheral(s) known", self.registry.len());
            }
        }
        let scan_failed = matches!(event, DelegateEvent::ScanFailed(_));
        trace!("Publishing to {} listener(s)", self.bus.listener_count());
        self.bus.publish(event);

        if scan_failed {
            warn!("Scan could not be started, ending scan streams");
            self.bus.close_scope(ListenerScope::Scan);
        }
    }
}

/// Owner of the hardware session and its broadcast event channel.
pub struct BleCoordinator {
    cmd_tx: mpsc::Sender<CoordinatorCmd>,
    _drop_tx: oneshot::Sender<()>,
}

impl BleCoordinator {
    pub fn new(
        stack: impl CentralStack, options: SessionOptions,
        req_buffer_size: usize,
    ) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(req_buffer_size);
        let (hw_tx, mut hw_rx) = mpsc::unbounded_channel();
        let (_drop_tx, mut drop_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let mut state = CoordinatorState {
                stack,
                options,
                session: None,
                last_session_id: 0,
                registry: PeripheralRegistry::new(),
                bus: EventBus::finished(),
                hw_tx,
            };

            //callbacks already queued are handled before the next command
            loop {
                tokio::select! {
                    biased;
                    _ = &mut drop_rx => {
                        info!("Ble coordinator task is stopping");
                        break;
                    }
                    Some(event) = hw_rx.recv() => state.handle_hardware_event(event),
                    Some(cmd) = cmd_rx.recv() => state.handle_cmd(cmd),
                }
            }

            state.reset();
        });

        Self { cmd_tx, _drop_tx }
    }

    async fn call<T>(
        &self, cmd: impl FnOnce(Responder<T>) -> CoordinatorCmd,
    ) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        if let Err(e) = self.cmd_tx.send(cmd(tx)).await {
            error!("Ble coordinator is not running: {:?}", e.to_string());
            return None;
        }
        rx.await.ok()
    }

    /// Replaces any existing hardware session with a fresh one and returns
    /// the radio state it reports right away.
    pub async fn enable(&self) -> Result<RadioState> {
        match self.call(|resp| CoordinatorCmd::Enable { resp }).await {
            Some(state) => state,
            None => Err(anyhow::anyhow!("Ble coordinator is not running")),
        }
    }

    /// Tears the session down. Every open stream ends and every in-flight
    /// operation resolves to `BleError::Finished`.
    pub async fn disable(&self) {
        self.call(|resp| CoordinatorCmd::Disable { resp }).await;
    }

    /// Raw subscription to every event of the current session.
    pub async fn events(&self) -> EventStream {
        match self.call(|resp| CoordinatorCmd::Subscribe { resp }).await {
            Some(events) => events,
            None => EventBus::finished().subscribe(ListenerScope::Session),
        }
    }

    pub async fn radio_states(&self) -> BoxStream<'static, RadioState> {
        self.events()
            .await
            .filter_map(|event| {
                future::ready(match event {
                    DelegateEvent::RadioStateChanged(state) => Some(state),
                    _ => None,
                })
            })
            .boxed()
    }

    /// Restarts scanning with `filter`. The stream ends when scanning is
    /// stopped, replaced by another scan, or the session goes away.
    pub async fn scan(
        &self, filter: ScanFilter,
    ) -> BoxStream<'static, (PeripheralHandle, Advertisement)> {
        let events = match self
            .call(|resp| CoordinatorCmd::Scan { filter, resp })
            .await
        {
            Some(events) => events,
            None => EventBus::finished().subscribe(ListenerScope::Scan),
        };

        events
            .filter_map(|event| {
                future::ready(match event {
                    DelegateEvent::AdvertisementSeen(peripheral, adv) => {
                        Some((peripheral, adv))
                    }
                    _ => None,
                })
            })
            .boxed()
    }

    pub async fn stop_scanning(&self) {
        self.call(|resp| CoordinatorCmd::StopScanning { resp }).await;
    }

    /// Looks up a peripheral reported during the current session.
    pub async fn discovered_peripheral(
        &self, id: Uuid,
    ) -> Option<PeripheralHandle> {
        self.call(|resp| CoordinatorCmd::DiscoveredPeripheral { id, resp })
            .await
            .flatten()
    }

    async fn perform<T, F>(
        &self, id: Uuid, request: PeripheralRequest, project: F,
    ) -> std::result::Result<T, BleError>
    where
        F: FnMut(DelegateEvent) -> Option<std::result::Result<T, BleError>>,
    {
        let events = match self
            .call(|resp| CoordinatorCmd::Request { id, request, resp })
            .await
        {
            Some(Ok(events)) => events,
            Some(Err(err)) => return Err(err),
            None => return Err(BleError::Finished),
        };

        first_result(events, Some(id), project).await
    }

    /// Connects to a discovered peripheral. Succeeds on the first
    /// `Connected` event for it, fails on the first `Disconnected` one.
    pub async fn connect(
        &self, id: Uuid,
    ) -> std::result::Result<PeripheralHandle, BleError> {
        self.perform(id, PeripheralRequest::Connect, |event| match event {
            DelegateEvent::Connected(peripheral) => Some(Ok(peripheral)),
            DelegateEvent::Disconnected(_, cause) => {
                Some(Err(BleError::from_cause(cause)))
            }
            _ => None,
        })
        .await
    }

    pub async fn disconnect(&self, id: Uuid) {
        let outcome = self
            .perform(id, PeripheralRequest::CancelConnection, |event| {
                match event {
                    DelegateEvent::Disconnected(..) => Some(Ok(())),
                    _ => None,
                }
            })
            .await;

        if let Err(e) = outcome {
            debug!("Disconnect of {} did not complete: {}", id, e);
        }
    }

    pub async fn discover_services(
        &self, id: Uuid, services: Option<Vec<Uuid>>,
    ) -> std::result::Result<PeripheralHandle, BleError> {
        let request = PeripheralRequest::DiscoverServices(services);
        self.perform(id, request, |event| match event {
            DelegateEvent::ServicesDiscovered(peripheral, None) => {
                Some(Ok(peripheral))
            }
            DelegateEvent::ServicesDiscovered(_, Some(err)) => {
                Some(Err(BleError::CausedBy(err)))
            }
            _ => None,
        })
        .await
    }

    pub async fn discover_characteristics(
        &self, id: Uuid, service: Uuid, characteristics: Option<Vec<Uuid>>,
    ) -> std::result::Result<PeripheralHandle, BleError> {
        let request = PeripheralRequest::DiscoverCharacteristics {
            service,
            filter: characteristics,
        };
        self.perform(id, request, move |event| match event {
            DelegateEvent::CharacteristicsDiscovered(peripheral, s, cause)
                if s == service =>
            {
                Some(match cause {
                    None => Ok(peripheral),
                    Some(err) => Err(BleError::CausedBy(err)),
                })
            }
            _ => None,
        })
        .await
    }

    pub async fn read_characteristic(
        &self, id: Uuid, characteristic: CharacteristicId,
    ) -> std::result::Result<Vec<u8>, BleError> {
        let request = PeripheralRequest::ReadValue(characteristic);
        self.perform(id, request, move |event| match event {
            DelegateEvent::CharacteristicUpdated(_, c, data, cause)
                if c == characteristic =>
            {
                Some(match cause {
                    None => Ok(data),
                    Some(err) => Err(BleError::CausedBy(err)),
                })
            }
            _ => None,
        })
        .await
    }

    /// Value updates (reads and notifications) of one peripheral.
    pub async fn characteristic_updates(
        &self, id: Uuid,
    ) -> BoxStream<
        'static,
        (CharacteristicId, std::result::Result<Vec<u8>, BleError>),
    > {
        self.events()
            .await
            .filter_map(move |event| {
                future::ready(match event {
                    DelegateEvent::CharacteristicUpdated(p, c, data, cause)
                        if p.identifier() == id =>
                    {
                        Some((
                            c,
                            match cause {
                                None => Ok(data),
                                Some(err) => Err(BleError::CausedBy(err)),
                            },
                        ))
                    }
                    _ => None,
                })
            })
            .boxed()
    }
}
