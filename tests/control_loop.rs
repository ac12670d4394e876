//! End-to-end control-loop runs over a scripted transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use idasen_control::desk::protocol::{decode_height, encode_height};
use idasen_control::desk::{
    ControlLoop, DeskEvent, Height, Intent, IntentMailbox, LoopExit, Opcode, Transport,
    TransportError,
};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Write {
    Up,
    Down,
    Stop,
}

#[derive(Default)]
struct FakeState {
    heights: Vec<f64>,
    cursor: usize,
    reads: usize,
    writes: Vec<Write>,
    fail_moves: bool,
}

/// Scripted desk: serves a height sequence (repeating the last value once
/// exhausted) and records every command write. Reads and writes cost a
/// little virtual time, like the real radio round-trip.
#[derive(Clone)]
struct FakeTransport(Arc<Mutex<FakeState>>);

impl FakeTransport {
    fn with_heights(heights: Vec<f64>) -> Self {
        Self(Arc::new(Mutex::new(FakeState {
            heights,
            ..FakeState::default()
        })))
    }

    fn failing_moves(heights: Vec<f64>) -> Self {
        let fake = Self::with_heights(heights);
        fake.0.lock().unwrap().fail_moves = true;
        fake
    }

    fn writes(&self) -> Vec<Write> {
        self.0.lock().unwrap().writes.clone()
    }

    fn reads(&self) -> usize {
        self.0.lock().unwrap().reads
    }
}

impl Transport for FakeTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&mut self) {}

    async fn is_connected(&self) -> bool {
        true
    }

    async fn write_command(&mut self, opcode: Opcode) -> Result<(), TransportError> {
        sleep(Duration::from_millis(5)).await;
        let mut state = self.0.lock().unwrap();
        if state.fail_moves {
            return Err(TransportError::NotConnected);
        }
        state.writes.push(match opcode {
            Opcode::Up => Write::Up,
            Opcode::Down => Write::Down,
            Opcode::Stop => Write::Stop,
        });
        Ok(())
    }

    async fn write_stop(&mut self) -> Result<(), TransportError> {
        sleep(Duration::from_millis(5)).await;
        self.0.lock().unwrap().writes.push(Write::Stop);
        Ok(())
    }

    async fn read_height(&mut self) -> Result<Height, TransportError> {
        sleep(Duration::from_millis(10)).await;
        let mut state = self.0.lock().unwrap();
        state.reads += 1;
        let index = state.cursor.min(state.heights.len() - 1);
        state.cursor += 1;
        let [lo, hi] = encode_height(state.heights[index]);
        decode_height(&[lo, hi, 0x00, 0x00])
    }
}

struct Harness {
    transport: FakeTransport,
    mailbox: IntentMailbox,
    events: mpsc::UnboundedReceiver<DeskEvent>,
    cancel: CancellationToken,
    worker: tokio::task::JoinHandle<LoopExit>,
}

fn start_loop(transport: FakeTransport) -> Harness {
    let mailbox = IntentMailbox::default();
    let (events_tx, events) = mpsc::unbounded_channel();
    let snapshot = Arc::new(Mutex::new(None));
    let cancel = CancellationToken::new();

    let mut control_loop = ControlLoop::new(
        transport.clone(),
        mailbox.clone(),
        events_tx,
        snapshot,
        cancel.clone(),
    );
    let worker = tokio::spawn(async move { control_loop.run().await });

    Harness {
        transport,
        mailbox,
        events,
        cancel,
        worker,
    }
}

async fn wait_for_event(
    events: &mut mpsc::UnboundedReceiver<DeskEvent>,
    mut predicate: impl FnMut(&DeskEvent) -> bool,
) -> DeskEvent {
    tokio::time::timeout(Duration::from_secs(300), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event never arrived")
}

#[tokio::test(start_paused = true)]
async fn homing_drives_up_and_stops_at_target() {
    // rises 2cm per read until it holds just inside the tolerance band
    let mut heights: Vec<f64> = (0..20).map(|i| 0.70 + 0.02 * f64::from(i)).collect();
    heights.push(1.096);

    let mut harness = start_loop(FakeTransport::with_heights(heights));
    harness.mailbox.post(Intent::MoveTo(1.10));

    let reached = wait_for_event(&mut harness.events, |e| {
        matches!(e, DeskEvent::ReachedTarget(_))
    })
    .await;
    assert_eq!(reached, DeskEvent::ReachedTarget(1.10));

    harness.cancel.cancel();
    let exit = harness.worker.await.unwrap();
    assert!(matches!(exit, LoopExit::Shutdown));

    let writes = harness.transport.writes();
    assert!(writes.iter().any(|w| *w == Write::Up));
    assert!(!writes.contains(&Write::Down));
    // one stop at the target, none after: the desk was already idle at shutdown
    assert_eq!(writes.iter().filter(|w| **w == Write::Stop).count(), 1);
    assert_eq!(writes.last(), Some(&Write::Stop));
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_manual_move_issues_a_final_stop() {
    let mut harness = start_loop(FakeTransport::with_heights(vec![0.80]));
    harness.mailbox.post(Intent::ManualUp);

    // let the hold run for a while in virtual time
    sleep(Duration::from_millis(200)).await;
    harness.cancel.cancel();
    let exit = harness.worker.await.unwrap();
    assert!(matches!(exit, LoopExit::Shutdown));

    let writes = harness.transport.writes();
    assert!(writes.iter().any(|w| *w == Write::Up));
    // the actuator is never left commanded to move with no controller attached
    assert_eq!(writes.last(), Some(&Write::Stop));
}

#[tokio::test(start_paused = true)]
async fn write_failure_faults_the_session_with_a_best_effort_stop() {
    let mut harness = start_loop(FakeTransport::failing_moves(vec![0.70]));
    harness.mailbox.post(Intent::MoveTo(1.10));

    let fault = wait_for_event(&mut harness.events, |e| matches!(e, DeskEvent::Fault(_))).await;
    assert!(matches!(fault, DeskEvent::Fault(_)));

    let exit = harness.worker.await.unwrap();
    assert!(matches!(exit, LoopExit::Fault(TransportError::NotConnected)));

    // the movement write failed before hitting the wire; the stop still went out
    assert_eq!(harness.transport.writes(), vec![Write::Stop]);
}

#[tokio::test(start_paused = true)]
async fn idle_session_throttles_height_polling() {
    let mut harness = start_loop(FakeTransport::with_heights(vec![0.80]));

    // initial read arrives immediately
    wait_for_event(&mut harness.events, |e| {
        matches!(e, DeskEvent::HeightChanged(_))
    })
    .await;
    let reads_at_start = harness.transport.reads();

    sleep(Duration::from_secs(20)).await;
    let reads = harness.transport.reads() - reads_at_start;

    // every ~10th idle tick at ~0.5s per tick: a handful of reads, not forty
    assert!((2..=6).contains(&reads), "got {reads} reads in 20s idle");

    // constant height produces no further HeightChanged events
    assert!(harness.events.try_recv().is_err());

    harness.cancel.cancel();
    let exit = harness.worker.await.unwrap();
    assert!(matches!(exit, LoopExit::Shutdown));
    assert!(harness.transport.writes().is_empty());
}
