//! Motion controller for IKEA Idasen standing desks over Bluetooth LE.
//!
//! The library is split the way the hardware is layered: a [`desk::Transport`]
//! encodes the BLE protocol, a [`desk::ConnectionManager`] owns the link
//! lifecycle, a [`desk::MotionEngine`] turns intents and height readings into
//! motor commands one tick at a time, and a [`desk::ControlLoop`] worker
//! drives it all on a single task. The [`desk::DeskController`] facade is
//! what a UI talks to.

pub mod config;
pub mod desk;
