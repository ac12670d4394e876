use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use std::time::Duration;
use tokio::time::{sleep, timeout};

use super::error::TransportError;
use super::protocol::{
    decode_height, Height, Opcode, COMMAND_CHARACTERISTIC_UUID, HEIGHT_CHARACTERISTIC_UUID,
    REFERENCE_INPUT_STOP, REFERENCE_INPUT_UUID,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const SCAN_TIMEOUT: Duration = Duration::from_secs(5);
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Bluetooth address of a desk, as reported by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeskIdentity(String);

impl DeskIdentity {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeskIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The wire seam the control loop drives.
///
/// `BleTransport` is the real implementation; tests substitute a scripted
/// fake. No control logic lives here, only protocol encoding and the link.
#[allow(async_fn_in_trait)]
pub trait Transport: Send + 'static {
    /// Establish the BLE session. One attempt; retry policy belongs to the
    /// connection manager.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Tear down the link. Idempotent, best-effort on the wire.
    async fn disconnect(&mut self);

    async fn is_connected(&self) -> bool;

    /// Fire-and-forget movement command; no write response is awaited.
    async fn write_command(&mut self, opcode: Opcode) -> Result<(), TransportError>;

    /// One logical stop: the motor stop opcode plus the reference-input
    /// stop payload. Both writes are always issued; a failure of either is
    /// reported but does not suppress the other.
    async fn write_stop(&mut self) -> Result<(), TransportError>;

    /// Read and decode the height characteristic.
    async fn read_height(&mut self) -> Result<Height, TransportError>;
}

/// btleplug-backed transport for a single desk.
pub struct BleTransport {
    identity: DeskIdentity,
    peripheral: Option<Peripheral>,
    command_char: Option<Characteristic>,
    height_char: Option<Characteristic>,
    reference_char: Option<Characteristic>,
}

impl BleTransport {
    pub fn new(identity: DeskIdentity) -> Self {
        Self {
            identity,
            peripheral: None,
            command_char: None,
            height_char: None,
            reference_char: None,
        }
    }

    pub fn identity(&self) -> &DeskIdentity {
        &self.identity
    }

    async fn default_adapter() -> Result<Adapter, TransportError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        adapters.into_iter().next().ok_or(TransportError::NoAdapter)
    }

    /// Scan until the configured address shows up, or give up after the
    /// scan window.
    async fn find_peripheral(&self, central: &Adapter) -> Result<Peripheral, TransportError> {
        central.start_scan(ScanFilter::default()).await?;

        let deadline = tokio::time::Instant::now() + SCAN_TIMEOUT;
        let found = loop {
            if let Some(p) = Self::match_address(central, &self.identity).await? {
                log::info!("Found desk peripheral at {}", self.identity);
                break Some(p);
            }
            if tokio::time::Instant::now() >= deadline {
                break None;
            }
            sleep(SCAN_POLL_INTERVAL).await;
        };

        let _ = central.stop_scan().await;
        found.ok_or_else(|| TransportError::DeviceNotFound(self.identity.to_string()))
    }

    async fn match_address(
        central: &Adapter,
        identity: &DeskIdentity,
    ) -> Result<Option<Peripheral>, TransportError> {
        for peripheral in central.peripherals().await? {
            if peripheral.address().to_string() == identity.as_str() {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    fn characteristic<'a>(
        &self,
        which: &'a Option<Characteristic>,
    ) -> Result<&'a Characteristic, TransportError> {
        which.as_ref().ok_or(TransportError::NotConnected)
    }

    async fn write_raw(
        peripheral: &Peripheral,
        characteristic: &Characteristic,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        peripheral
            .write(characteristic, payload, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    /// Scan nearby devices and return the first whose advertised name starts
    /// with "Desk". Scan failures are swallowed: callers cannot distinguish
    /// "no desk nearby" from "scan itself failed".
    pub async fn discover() -> Option<DeskIdentity> {
        match Self::try_discover().await {
            Ok(found) => found,
            Err(e) => {
                log::debug!("Discovery scan failed: {}", e);
                None
            }
        }
    }

    async fn try_discover() -> Result<Option<DeskIdentity>, TransportError> {
        let central = Self::default_adapter().await?;

        log::info!("Starting BLE scan for desks...");
        central.start_scan(ScanFilter::default()).await?;
        sleep(SCAN_TIMEOUT).await;

        let peripherals = central.peripherals().await?;
        log::info!("Found {} BLE devices", peripherals.len());

        let mut found = None;
        for peripheral in peripherals {
            if let Ok(Some(properties)) = peripheral.properties().await {
                if let Some(name) = properties.local_name {
                    if name.starts_with("Desk") {
                        log::info!("Discovered desk: {} ({})", name, properties.address);
                        found = Some(DeskIdentity::new(properties.address.to_string()));
                        break;
                    }
                }
            }
        }

        let _ = central.stop_scan().await;
        Ok(found)
    }
}

impl Transport for BleTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let central = Self::default_adapter().await?;
        let peripheral = self.find_peripheral(&central).await?;

        let already_connected = peripheral.is_connected().await.unwrap_or(false);
        if !already_connected {
            log::info!("Establishing connection to {}...", self.identity);
            timeout(CONNECT_TIMEOUT, peripheral.connect())
                .await
                .map_err(|_| TransportError::Timeout("connect"))??;
        } else {
            log::info!("Desk {} already connected", self.identity);
        }

        log::info!("Discovering desk services and characteristics...");
        timeout(DISCOVERY_TIMEOUT, peripheral.discover_services())
            .await
            .map_err(|_| TransportError::Timeout("service discovery"))??;

        let chars = peripheral.characteristics();
        log::debug!("Found {} characteristics total", chars.len());

        let find = |uuid| chars.iter().find(|c| c.uuid == uuid).cloned();
        self.command_char = Some(
            find(COMMAND_CHARACTERISTIC_UUID)
                .ok_or(TransportError::MissingCharacteristic(COMMAND_CHARACTERISTIC_UUID))?,
        );
        self.height_char = Some(
            find(HEIGHT_CHARACTERISTIC_UUID)
                .ok_or(TransportError::MissingCharacteristic(HEIGHT_CHARACTERISTIC_UUID))?,
        );
        self.reference_char = Some(
            find(REFERENCE_INPUT_UUID)
                .ok_or(TransportError::MissingCharacteristic(REFERENCE_INPUT_UUID))?,
        );
        self.peripheral = Some(peripheral);

        log::info!("Desk transport ready");
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(peripheral) = self.peripheral.take() {
            if peripheral.is_connected().await.unwrap_or(false) {
                if let Err(e) = peripheral.disconnect().await {
                    log::warn!("Disconnect from {} failed: {}", self.identity, e);
                } else {
                    log::info!("Disconnected from desk {}", self.identity);
                }
            }
        }
        self.command_char = None;
        self.height_char = None;
        self.reference_char = None;
    }

    async fn is_connected(&self) -> bool {
        match &self.peripheral {
            Some(p) => p.is_connected().await.unwrap_or(false),
            None => false,
        }
    }

    async fn write_command(&mut self, opcode: Opcode) -> Result<(), TransportError> {
        let peripheral = self.peripheral.as_ref().ok_or(TransportError::NotConnected)?;
        let command_char = self.characteristic(&self.command_char)?;

        log::debug!("Sending command {:?} -> {:02X?}", opcode, opcode.to_bytes());
        Self::write_raw(peripheral, command_char, &opcode.to_bytes()).await
    }

    async fn write_stop(&mut self) -> Result<(), TransportError> {
        let peripheral = self.peripheral.as_ref().ok_or(TransportError::NotConnected)?;
        let command_char = self.characteristic(&self.command_char)?;
        let reference_char = self.characteristic(&self.reference_char)?;

        log::debug!("Sending stop (command + reference input)");
        let stop_bytes = Opcode::Stop.to_bytes();
        let (motor, reference) = tokio::join!(
            Self::write_raw(peripheral, command_char, &stop_bytes),
            Self::write_raw(peripheral, reference_char, &REFERENCE_INPUT_STOP),
        );
        if let Err(e) = &reference {
            log::warn!("Reference-input stop write failed: {}", e);
        }
        motor.and(reference)
    }

    async fn read_height(&mut self) -> Result<Height, TransportError> {
        let peripheral = self.peripheral.as_ref().ok_or(TransportError::NotConnected)?;
        let height_char = self.characteristic(&self.height_char)?;

        let data = peripheral.read(height_char).await?;
        log::trace!("Read {} bytes from height characteristic: {:02X?}", data.len(), data);
        decode_height(&data)
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        // Best effort disconnect
        if self.peripheral.is_some() {
            futures::executor::block_on(self.disconnect());
        }
    }
}
