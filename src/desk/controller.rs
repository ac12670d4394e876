use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, PresetSlot};

use super::connection::{ConnectionManager, ConnectionState};
use super::engine::{DeskEvent, Intent, MotionEngine, MotionState, MotorCommand};
use super::error::{ConnectionError, TransportError};
use super::protocol::Opcode;
use super::transport::{BleTransport, DeskIdentity, Transport};

/// Height is re-read every Nth tick while nothing is happening.
const IDLE_REFRESH_TICKS: u32 = 10;

/// Sleep between idle ticks, so an idle session does not busy-poll the radio.
const IDLE_TICK_SLEEP: Duration = Duration::from_millis(500);

/// Single-slot, overwrite-on-write handoff of the collaborator's intent.
///
/// The most recently posted value wins; the worker drains the slot once per
/// tick. There is no queue of historical intents.
#[derive(Clone, Default)]
pub struct IntentMailbox {
    slot: Arc<Mutex<Option<Intent>>>,
}

impl IntentMailbox {
    pub fn post(&self, intent: Intent) {
        *self.slot.lock().expect("intent slot lock poisoned") = Some(intent);
    }

    pub fn take(&self) -> Option<Intent> {
        self.slot.lock().expect("intent slot lock poisoned").take()
    }
}

/// Latest engine snapshot, `None` while no session is live.
pub type SharedSnapshot = Arc<Mutex<Option<MotionState>>>;

/// Why the control loop stopped ticking.
#[derive(Debug)]
pub enum LoopExit {
    /// Cooperative shutdown; the desk was left stopped.
    Shutdown,
    /// The session died on a transport or protocol error.
    Fault(TransportError),
}

/// The periodic driver of the motion engine, and the single writer of motor
/// commands: all BLE I/O of a session happens here, on one worker task.
///
/// Ticks run back-to-back while movement is active (the engine's own settle
/// and recovery pauses pace them); idle ticks sleep and only poll height
/// every [`IDLE_REFRESH_TICKS`]th round.
pub struct ControlLoop<T: Transport> {
    transport: T,
    mailbox: IntentMailbox,
    events: mpsc::UnboundedSender<DeskEvent>,
    snapshot: SharedSnapshot,
    cancel: CancellationToken,
}

impl<T: Transport> ControlLoop<T> {
    pub fn new(
        transport: T,
        mailbox: IntentMailbox,
        events: mpsc::UnboundedSender<DeskEvent>,
        snapshot: SharedSnapshot,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            mailbox,
            events,
            snapshot,
            cancel,
        }
    }

    /// Hand the link back once the loop has exited.
    pub fn into_transport(self) -> T {
        self.transport
    }

    pub async fn run(&mut self) -> LoopExit {
        log::info!("Control loop started");

        let mut height = match self.transport.read_height().await {
            Ok(h) => h,
            Err(e) => return self.fault(e).await,
        };
        self.send_event(DeskEvent::HeightChanged(height));

        let mut engine = MotionEngine::new(height);
        self.publish(&engine);
        let mut idle_ticks = 0u32;

        let exit = loop {
            // The cancel flag is only observed at tick boundaries; an
            // in-flight write always completes first.
            if self.cancel.is_cancelled() {
                if engine.is_moving() {
                    log::info!("Shutdown during movement, issuing final stop");
                    let _ = self.transport.write_stop().await;
                }
                break LoopExit::Shutdown;
            }

            let signal = self.mailbox.take();
            let tick = engine.tick(signal, height);

            if let Some(command) = tick.command {
                let written = match command {
                    MotorCommand::Up => self.transport.write_command(Opcode::Up).await,
                    MotorCommand::Down => self.transport.write_command(Opcode::Down).await,
                    MotorCommand::Stop => self.transport.write_stop().await,
                };
                if let Err(e) = written {
                    engine.reset();
                    break self.fault(e).await;
                }
            }
            if let Some(event) = tick.event {
                self.send_event(event);
            }
            self.publish(&engine);

            if let Some(pause) = tick.pause {
                sleep(pause).await;
            }

            if tick.refresh || idle_ticks >= IDLE_REFRESH_TICKS {
                match self.transport.read_height().await {
                    Ok(h) => {
                        if h != height {
                            height = h;
                            self.send_event(DeskEvent::HeightChanged(h));
                        }
                    }
                    Err(e) => {
                        engine.reset();
                        break self.fault(e).await;
                    }
                }
                idle_ticks = 0;
            } else {
                idle_ticks += 1;
                sleep(IDLE_TICK_SLEEP).await;
            }
        };

        *self.snapshot.lock().expect("snapshot lock poisoned") = None;
        log::info!("Control loop stopped");
        exit
    }

    async fn fault(&mut self, error: TransportError) -> LoopExit {
        log::error!("Desk session fault: {}", error);
        // best-effort stop; the session is going away either way
        let _ = self.transport.write_stop().await;
        self.send_event(DeskEvent::Fault(error.to_string()));
        LoopExit::Fault(error)
    }

    fn publish(&self, engine: &MotionEngine) {
        *self.snapshot.lock().expect("snapshot lock poisoned") = Some(engine.state().clone());
    }

    fn send_event(&self, event: DeskEvent) {
        if self.events.send(event).is_err() {
            log::debug!("No event subscriber, dropping event");
        }
    }
}

struct Session {
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

/// Facade the UI collaborator talks to.
///
/// Communication is deliberately narrow: intents go in through the mailbox,
/// height/state come back as snapshots and [`DeskEvent`]s. Nothing outside
/// the worker ever touches the transport.
pub struct DeskController {
    config: Mutex<Config>,
    manager: ConnectionManager,
    mailbox: IntentMailbox,
    events_tx: mpsc::UnboundedSender<DeskEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<DeskEvent>>>,
    snapshot: SharedSnapshot,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl DeskController {
    pub fn new(config: Config) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config: Mutex::new(config),
            manager: ConnectionManager::new(),
            mailbox: IntentMailbox::default(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            snapshot: Arc::new(Mutex::new(None)),
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// The event stream, claimable once by the collaborating UI.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DeskEvent>> {
        self.events_rx.lock().expect("events lock poisoned").take()
    }

    pub fn set_intent(&self, intent: Intent) {
        self.mailbox.post(intent);
    }

    pub fn snapshot(&self) -> Option<MotionState> {
        self.snapshot.lock().expect("snapshot lock poisoned").clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn saved_identity(&self) -> Option<DeskIdentity> {
        self.config
            .lock()
            .expect("config lock poisoned")
            .desk_address
            .as_deref()
            .map(DeskIdentity::new)
    }

    pub fn connect_retries(&self) -> u32 {
        self.config.lock().expect("config lock poisoned").connect_retries
    }

    pub fn position(&self, slot: PresetSlot) -> f64 {
        self.config.lock().expect("config lock poisoned").position(slot)
    }

    /// Store the latest known height as a named position and persist it.
    pub fn save_position(&self, slot: PresetSlot) -> anyhow::Result<f64> {
        let state = self
            .snapshot()
            .ok_or_else(|| anyhow::anyhow!("No desk session, current height unknown"))?;
        let meters = state.height.meters();
        let mut config = self.config.lock().expect("config lock poisoned");
        config.set_position(slot, meters);
        config.save()?;
        Ok(meters)
    }

    /// Scan for a desk by its advertised name. A find is remembered in the
    /// configuration; `None` covers both "nothing nearby" and a failed scan.
    pub async fn discover_desk(&self) -> Option<DeskIdentity> {
        let identity = BleTransport::discover().await?;
        {
            let mut config = self.config.lock().expect("config lock poisoned");
            config.desk_address = Some(identity.to_string());
            if let Err(e) = config.save() {
                log::warn!("Could not persist discovered desk address: {}", e);
            }
        }
        Some(identity)
    }

    /// Establish a session and start the control-loop worker.
    ///
    /// `max_retries = 0` fails fast (the interactive path); a positive value
    /// is the best-effort startup mode.
    pub async fn connect(
        &self,
        identity: DeskIdentity,
        max_retries: u32,
    ) -> Result<(), ConnectionError> {
        let mut session = self.session.lock().await;

        if let Some(existing) = session.take() {
            if !existing.worker.is_finished() {
                log::warn!("Already connected, ignoring connect request");
                *session = Some(existing);
                return Ok(());
            }
            // reap a worker that already died on a fault
            let _ = existing.worker.await;
        }

        let mut transport = BleTransport::new(identity);
        self.manager.establish(&mut transport, max_retries).await?;

        let cancel = CancellationToken::new();
        let mut control_loop = ControlLoop::new(
            transport,
            self.mailbox.clone(),
            self.events_tx.clone(),
            Arc::clone(&self.snapshot),
            cancel.clone(),
        );
        let manager = self.manager.clone();
        let worker = tokio::spawn(async move {
            let exit = control_loop.run().await;
            let transport = control_loop.into_transport();
            match exit {
                LoopExit::Shutdown => manager.release(transport).await,
                LoopExit::Fault(e) => manager.fail(transport, e.to_string()).await,
            }
        });

        *session = Some(Session { cancel, worker });
        Ok(())
    }

    /// Cooperative shutdown: the worker finishes its current tick, stops any
    /// movement, and releases the link before this returns.
    pub async fn shutdown(&self) {
        let mut session = self.session.lock().await;
        if let Some(session) = session.take() {
            log::info!("Shutting down desk session");
            session.cancel.cancel();
            if let Err(e) = session.worker.await {
                log::warn!("Control loop worker ended abnormally: {}", e);
            }
        }
    }
}
