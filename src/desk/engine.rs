use std::time::Duration;

use super::protocol::{Height, MAX_HEIGHT_M, MIN_HEIGHT_M};

/// Stop once the height is within this band of the target.
const TARGET_TOLERANCE_M: f64 = 0.005;

/// Consecutive unchanged-difference ticks tolerated before a recovery pause.
const STALL_SAMPLE_LIMIT: u32 = 9;

/// Recovery pauses tolerated before the move is abandoned.
const STALL_RETRY_LIMIT: u32 = 2;

/// How long to let the desk catch up when it stops acknowledging movement.
pub const STALL_RECOVERY_PAUSE: Duration = Duration::from_secs(1);

/// Actuator settle delay after the first command of an upward segment.
pub const SETTLE_UP: Duration = Duration::from_millis(500);

/// Settle delay for a downward segment; lowering takes the desk longer.
pub const SETTLE_DOWN: Duration = Duration::from_millis(750);

/// What the collaborator wants the desk to do right now.
///
/// Last write wins: the UI owns transitions (button down sets a manual
/// variant, button up sets `None`, a memory button sets `MoveTo`). A manual
/// variant overwrites and cancels an automatic move.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Intent {
    #[default]
    None,
    ManualUp,
    ManualDown,
    MoveTo(f64),
}

/// Live movement mode. `MovingUp`/`MovingDown` are manual holds; `Homing`
/// is an automatic move toward the stored target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Idle,
    MovingUp,
    MovingDown,
    Homing,
}

/// Motor command for the transport to put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorCommand {
    Up,
    Down,
    Stop,
}

/// Notifications delivered to the collaborator, in generation order.
#[derive(Debug, Clone, PartialEq)]
pub enum DeskEvent {
    HeightChanged(Height),
    ReachedTarget(f64),
    /// A `MoveTo` outside the device limits was ignored.
    TargetRejected(f64),
    /// The stall guard gave up on the current move; the session survives.
    Stalled,
    /// The session died; the link is being released.
    Fault(String),
}

/// Read-only snapshot of the engine, handed to the collaborator as a copy.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionState {
    pub height: Height,
    pub mode: Mode,
    pub target: Option<f64>,
    pub stall_samples: u32,
    pub stall_retries: u32,
    pub last_difference: Option<f64>,
}

/// Outcome of one tick: at most one command, at most one event, an optional
/// pause for the worker to sleep, and whether the next height read should
/// happen immediately instead of on the idle cadence.
#[derive(Debug, Default, PartialEq)]
pub struct Tick {
    pub command: Option<MotorCommand>,
    pub event: Option<DeskEvent>,
    pub pause: Option<Duration>,
    pub refresh: bool,
}

/// The control-loop state machine.
///
/// All transitions happen inside [`tick`](Self::tick); the engine never
/// performs I/O and never blocks. Pauses it wants (stall recovery, settle
/// delays) come back as data for the worker to sleep.
pub struct MotionEngine {
    state: MotionState,
    /// Direction of the current homing segment; settle delays apply once
    /// per direction change.
    homing_direction: Option<MotorCommand>,
}

impl MotionEngine {
    pub fn new(height: Height) -> Self {
        Self {
            state: MotionState {
                height,
                mode: Mode::Idle,
                target: None,
                stall_samples: 0,
                stall_retries: 0,
                last_difference: None,
            },
            homing_direction: None,
        }
    }

    pub fn state(&self) -> &MotionState {
        &self.state
    }

    pub fn is_moving(&self) -> bool {
        self.state.mode != Mode::Idle
    }

    /// Drop any movement and target, e.g. after a transport fault.
    pub fn reset(&mut self) {
        self.clear_movement();
    }

    /// Advance the state machine by one tick.
    ///
    /// `signal` is the freshly drained intent mailbox slot, `None` when the
    /// collaborator had nothing new to say; an ongoing manual hold or homing
    /// move continues without a fresh signal.
    pub fn tick(&mut self, signal: Option<Intent>, height: Height) -> Tick {
        self.state.height = height;

        if let Some(intent) = signal {
            match intent {
                Intent::ManualUp => self.begin_manual(Mode::MovingUp),
                Intent::ManualDown => self.begin_manual(Mode::MovingDown),
                Intent::MoveTo(target) => {
                    if let Some(tick) = self.request_target(target) {
                        return tick;
                    }
                }
                Intent::None => {
                    // A release only ends a manual hold; homing keeps its
                    // queued target.
                    if matches!(self.state.mode, Mode::MovingUp | Mode::MovingDown) {
                        log::debug!("Manual release, stopping");
                        self.clear_movement();
                        return Tick {
                            command: Some(MotorCommand::Stop),
                            refresh: true,
                            ..Tick::default()
                        };
                    }
                }
            }
        }

        match self.state.mode {
            Mode::MovingUp => Self::manual_tick(MotorCommand::Up),
            Mode::MovingDown => Self::manual_tick(MotorCommand::Down),
            _ if self.state.target.is_some() => self.homing_tick(),
            _ => Tick::default(),
        }
    }

    /// A manual hold pre-empts everything: the target is cleared and any
    /// homing segment is abandoned immediately.
    fn begin_manual(&mut self, mode: Mode) {
        self.clear_movement();
        self.state.mode = mode;
    }

    fn manual_tick(direction: MotorCommand) -> Tick {
        log::debug!("Manual {:?}...", direction);
        Tick {
            command: Some(direction),
            refresh: true,
            ..Tick::default()
        }
    }

    /// Latch a new homing target, or reject one outside the device limits.
    /// Returns the tick to emit when the request ends this tick's work.
    fn request_target(&mut self, target: f64) -> Option<Tick> {
        if !(MIN_HEIGHT_M..=MAX_HEIGHT_M).contains(&target) {
            log::warn!(
                "Target height of {:.3} exceeds device limits [{:.2}, {:.2}]",
                target,
                MIN_HEIGHT_M,
                MAX_HEIGHT_M
            );
            let was_homing = self.state.target.is_some();
            self.clear_movement();
            // A rejected target cancels an in-progress move; the desk must
            // not be left coasting on its last command.
            return Some(Tick {
                command: was_homing.then_some(MotorCommand::Stop),
                event: Some(DeskEvent::TargetRejected(target)),
                refresh: was_homing,
                ..Tick::default()
            });
        }

        log::info!("Moving to target height of {:.3} meters", target);
        if self.state.mode != Mode::Homing {
            self.homing_direction = None;
        }
        self.state.mode = Mode::Homing;
        self.state.target = Some(target);
        self.state.stall_samples = 0;
        self.state.stall_retries = 0;
        self.state.last_difference = None;
        None
    }

    fn homing_tick(&mut self) -> Tick {
        let target = match self.state.target {
            Some(t) => t,
            None => return Tick::default(),
        };
        let difference = target - self.state.height.meters();
        log::debug!(
            "target={:.3} height={:.3} difference={:.3}",
            target,
            self.state.height.meters(),
            difference
        );

        // The desk's motor controller occasionally stops acknowledging
        // movement mid-command; an exactly unchanged difference across
        // consecutive ticks means nothing is moving.
        if self.state.last_difference == Some(difference) {
            self.state.stall_samples += 1;
        } else {
            self.state.stall_samples = 0;
            self.state.stall_retries = 0;
            self.state.last_difference = Some(difference);
        }

        let mut pause = None;
        if self.state.stall_samples > STALL_SAMPLE_LIMIT {
            self.state.stall_samples = 0;
            self.state.stall_retries += 1;
            if self.state.stall_retries > STALL_RETRY_LIMIT {
                log::warn!("Desk is not responding, cancelling move to {:.2}", target);
                self.clear_movement();
                return Tick {
                    command: Some(MotorCommand::Stop),
                    event: Some(DeskEvent::Stalled),
                    refresh: true,
                    ..Tick::default()
                };
            }
            log::info!("Waiting for desk to catch up...");
            pause = Some(STALL_RECOVERY_PAUSE);
        }

        if difference.abs() < TARGET_TOLERANCE_M {
            log::info!("Reached target of {:.2}", target);
            self.clear_movement();
            return Tick {
                command: Some(MotorCommand::Stop),
                event: Some(DeskEvent::ReachedTarget(target)),
                refresh: true,
                ..Tick::default()
            };
        }

        let direction = if difference > 0.0 {
            MotorCommand::Up
        } else {
            MotorCommand::Down
        };
        if pause.is_none() && self.homing_direction != Some(direction) {
            // The actuator lags behind the first command of a new segment.
            pause = Some(match direction {
                MotorCommand::Up => SETTLE_UP,
                _ => SETTLE_DOWN,
            });
        }
        self.homing_direction = Some(direction);

        Tick {
            command: Some(direction),
            pause,
            refresh: true,
            ..Tick::default()
        }
    }

    fn clear_movement(&mut self) {
        self.state.mode = Mode::Idle;
        self.state.target = None;
        self.state.stall_samples = 0;
        self.state.stall_retries = 0;
        self.state.last_difference = None;
        self.homing_direction = None;
    }
}
