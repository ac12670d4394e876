use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use super::error::ConnectionError;
use super::transport::Transport;

/// Base of the linear backoff between connection attempts.
const RETRY_BACKOFF: Duration = Duration::from_millis(300);

/// Lifecycle of the BLE link. Transitions are driven only by the
/// [`ConnectionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
    Faulted { reason: String },
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

/// Owner of the physical link's lifecycle.
///
/// BLE pairing is flaky; bounded retry with backoff absorbs transient
/// radio and OS issues without looping forever. Once connected, the
/// transport is handed to the control-loop worker for exclusive use and
/// comes back through [`release`](Self::release) or [`fail`](Self::fail).
#[derive(Clone, Default)]
pub struct ConnectionManager {
    state: Arc<Mutex<ConnectionState>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().expect("connection state lock poisoned").clone()
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().expect("connection state lock poisoned");
        log::debug!("Connection state: {:?} -> {:?}", *state, next);
        *state = next;
    }

    /// Drive `transport.connect()` with bounded retries and linearly
    /// increasing backoff (0.3s × attempt number).
    ///
    /// `max_retries` counts retries after the first failed attempt;
    /// `0` means fail fast with a single attempt, the mode used by the
    /// interactive connect-on-demand path.
    pub async fn establish<T: Transport>(
        &self,
        transport: &mut T,
        max_retries: u32,
    ) -> Result<(), ConnectionError> {
        let mut attempt = 1u32;
        loop {
            self.set_state(ConnectionState::Connecting { attempt });
            match transport.connect().await {
                Ok(()) => {
                    log::info!("Connected on attempt {}", attempt);
                    self.set_state(ConnectionState::Connected);
                    return Ok(());
                }
                Err(e) => {
                    if attempt > max_retries {
                        log::error!("Connection failed after {} attempts: {}", attempt, e);
                        self.set_state(ConnectionState::Faulted { reason: e.to_string() });
                        return Err(ConnectionError::Exhausted {
                            attempts: attempt,
                            last: e,
                        });
                    }
                    log::warn!(
                        "Failed to connect, retrying ({}/{}): {}",
                        attempt,
                        max_retries,
                        e
                    );
                    sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Clean teardown after a session ends.
    pub async fn release<T: Transport>(&self, mut transport: T) {
        transport.disconnect().await;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Teardown after a session fault; the state keeps the reason for the
    /// UI to surface.
    pub async fn fail<T: Transport>(&self, mut transport: T, reason: String) {
        transport.disconnect().await;
        self.set_state(ConnectionState::Faulted { reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desk::error::TransportError;
    use crate::desk::protocol::{decode_height, Height, Opcode};

    /// Transport whose first `fail_times` connect calls fail.
    struct FlakyTransport {
        fail_times: u32,
        attempts: u32,
    }

    impl FlakyTransport {
        fn failing_forever() -> Self {
            Self {
                fail_times: u32::MAX,
                attempts: 0,
            }
        }
    }

    impl Transport for FlakyTransport {
        async fn connect(&mut self) -> Result<(), TransportError> {
            self.attempts += 1;
            if self.attempts <= self.fail_times {
                Err(TransportError::Timeout("connect"))
            } else {
                Ok(())
            }
        }

        async fn disconnect(&mut self) {}

        async fn is_connected(&self) -> bool {
            self.attempts > self.fail_times
        }

        async fn write_command(&mut self, _opcode: Opcode) -> Result<(), TransportError> {
            Ok(())
        }

        async fn write_stop(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn read_height(&mut self) -> Result<Height, TransportError> {
            decode_height(&[0x00, 0x00, 0x00, 0x00])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fault_the_manager() {
        let manager = ConnectionManager::new();
        let mut transport = FlakyTransport::failing_forever();

        let err = manager.establish(&mut transport, 3).await.unwrap_err();

        // initial attempt plus three retries, then nothing further
        assert_eq!(transport.attempts, 4);
        let ConnectionError::Exhausted { attempts, .. } = err;
        assert_eq!(attempts, 4);
        assert!(matches!(manager.state(), ConnectionState::Faulted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_fails_fast() {
        let manager = ConnectionManager::new();
        let mut transport = FlakyTransport::failing_forever();

        let err = manager.establish(&mut transport, 0).await.unwrap_err();

        assert_eq!(transport.attempts, 1);
        let ConnectionError::Exhausted { attempts, .. } = err;
        assert_eq!(attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_within_retry_budget() {
        let manager = ConnectionManager::new();
        let mut transport = FlakyTransport {
            fail_times: 2,
            attempts: 0,
        };

        manager.establish(&mut transport, 3).await.unwrap();

        assert_eq!(transport.attempts, 3);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }
}
