pub mod connection;
pub mod controller;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod transport;

pub use connection::{ConnectionManager, ConnectionState};
pub use controller::{ControlLoop, DeskController, IntentMailbox, LoopExit, SharedSnapshot};
pub use engine::{DeskEvent, Intent, Mode, MotionEngine, MotionState, MotorCommand, Tick};
pub use error::{ConnectionError, TransportError};
pub use protocol::{Height, Opcode, MAX_HEIGHT_M, MIN_HEIGHT_M};
pub use transport::{BleTransport, DeskIdentity, Transport};
