use thiserror::Error;
use uuid::Uuid;

/// Link-level failures raised by the BLE transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying BLE stack returned an error.
    #[error("bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No Bluetooth adapter is available on this machine.
    #[error("no bluetooth adapter found")]
    NoAdapter,

    /// The configured desk never showed up in the scan.
    #[error("desk {0} not found during scan")]
    DeviceNotFound(String),

    /// An operation was attempted without an established session.
    #[error("desk is not connected")]
    NotConnected,

    /// The connected device is missing a required characteristic.
    #[error("characteristic {0} not found on desk")]
    MissingCharacteristic(Uuid),

    /// Connect or service discovery exceeded its deadline.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// The height characteristic returned a malformed payload.
    #[error("height payload must be {expected} bytes, got {got}")]
    Protocol { expected: usize, got: usize },
}

/// Failures of the managed connect path.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Every allowed attempt failed; the manager is now faulted.
    #[error("connection attempts exhausted after {attempts} tries: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: TransportError,
    },
}
