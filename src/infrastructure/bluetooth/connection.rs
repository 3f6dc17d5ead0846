//! Bluetooth session: pairing, service activation and port resolution.

use super::registry::find_port_name;
use super::scanner::{scan, DeviceFilter, DEFAULT_INQUIRY_TIMEOUT};
use super::{BluetoothBackend, PairResult};
use crate::domain::error::{CardError, Result};
use crate::domain::models::{BluetoothAddress, DeviceInfo};
use crate::domain::settings::{PairingMode, Settings};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What to do when the card rejects a pairing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingStrategy {
    /// Log the rejection and move on to the next candidate.
    SkipFailed,
    /// Run the whole pairing pass again, at most `max_retries` more times.
    Retry { max_retries: u32 },
}

impl Default for PairingStrategy {
    fn default() -> Self {
        Self::Retry { max_retries: 1 }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub adapter_address: Option<BluetoothAddress>,
    pub filter: DeviceFilter,
    pub pin: String,
    pub inquiry_timeout: Duration,
    pub pairing: PairingStrategy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            adapter_address: None,
            filter: DeviceFilter::default(),
            pin: "0000".to_string(),
            inquiry_timeout: DEFAULT_INQUIRY_TIMEOUT,
            pairing: PairingStrategy::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let adapter_address = settings
            .adapter_address
            .as_deref()
            .and_then(|s| match s.parse() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!("Ignoring adapter address: {}", e);
                    None
                }
            });
        let pairing = match settings.pairing_mode {
            PairingMode::SkipFailed => PairingStrategy::SkipFailed,
            PairingMode::Retry => PairingStrategy::Retry {
                max_retries: settings.pairing_max_retries,
            },
        };
        Self {
            adapter_address,
            filter: DeviceFilter::from_settings(settings.card_name.as_deref(), &settings.device_class),
            pin: settings.card_pin.clone(),
            inquiry_timeout: settings.inquiry_timeout(),
            pairing,
        }
    }
}

/// Result of one walk over the candidate list.
enum PassOutcome {
    Done,
    Rejected(DeviceInfo),
}

pub struct BluetoothSession<B: BluetoothBackend> {
    backend: B,
    config: SessionConfig,
    candidates: Vec<DeviceInfo>,
    active: Option<DeviceInfo>,
    adapter_selected: bool,
}

impl<B: BluetoothBackend> BluetoothSession<B> {
    /// Select the configured adapter, run the inquiry and keep the devices
    /// matching the configured filter.
    pub fn new(backend: B, config: SessionConfig) -> Result<Self> {
        let mut session = Self::deferred(backend, config);
        session.rediscover()?;
        Ok(session)
    }

    /// A session that has not touched the radio yet; see [`Self::rediscover`].
    pub fn deferred(backend: B, config: SessionConfig) -> Self {
        Self {
            backend,
            config,
            candidates: Vec::new(),
            active: None,
            adapter_selected: false,
        }
    }

    pub fn candidates(&self) -> &[DeviceInfo] {
        &self.candidates
    }

    pub fn active_device(&self) -> Option<&DeviceInfo> {
        self.active.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Repeat the inquiry, replacing the candidate list.
    pub fn rediscover(&mut self) -> Result<usize> {
        self.select_adapter()?;
        self.candidates = scan(&mut self.backend, &self.config.filter, self.config.inquiry_timeout)?;
        Ok(self.candidates.len())
    }

    /// Select the first candidate and require it to be paired already.
    pub fn check_device_list(&mut self) -> Result<&DeviceInfo> {
        let first = self
            .candidates
            .first()
            .cloned()
            .ok_or(CardError::DeviceSearchFailed)?;

        let paired = self.paired_addresses()?;
        if !first.authenticated && !paired.contains(&first.address) {
            return Err(CardError::NotPaired(format!("{} ({})", first.name, first.address)));
        }

        Ok(self.active.insert(first))
    }

    /// Pair every unpaired candidate with `pin` and pick the active device.
    pub fn pair(&mut self, pin: &str) -> Result<()> {
        if self.candidates.is_empty() {
            return Err(CardError::DeviceSearchFailed);
        }

        let mut retries = 0;
        loop {
            match self.pair_pass(pin)? {
                PassOutcome::Done => break,
                PassOutcome::Rejected(device) => match self.config.pairing {
                    PairingStrategy::Retry { max_retries } if retries < max_retries => {
                        retries += 1;
                        warn!(
                            "Pairing rejected by {}, retrying pass ({}/{})",
                            device.address, retries, max_retries
                        );
                    }
                    _ => {
                        return Err(CardError::AuthenticationFailed {
                            address: device.address.to_string(),
                            reason: "pairing request rejected".to_string(),
                        })
                    }
                },
            }
        }

        match &self.active {
            Some(device) => {
                info!("Active card {} ({})", device.name, device.address);
                Ok(())
            }
            None => Err(CardError::NotPaired(
                "no candidate accepted the pairing request".to_string(),
            )),
        }
    }

    fn pair_pass(&mut self, pin: &str) -> Result<PassOutcome> {
        let paired = self.paired_addresses()?;
        self.active = None;

        for device in self.candidates.clone() {
            if !paired.contains(&device.address) {
                debug!("Requesting pairing with {}", device.address);
                match self.backend.pair_request(&device, pin)? {
                    PairResult::Paired => info!("Paired with {}", device.address),
                    PairResult::Rejected => match self.config.pairing {
                        PairingStrategy::SkipFailed => {
                            warn!("Pairing rejected by {}, skipping", device.address);
                            continue;
                        }
                        PairingStrategy::Retry { .. } => return Ok(PassOutcome::Rejected(device)),
                    },
                }
            }

            if self.active.is_none() {
                let mut device = device;
                device.authenticated = true;
                self.active = Some(device);
            }
        }
        Ok(PassOutcome::Done)
    }

    /// Turn on the serial service of the active device.
    pub fn enable_serial_port(&mut self) -> Result<()> {
        let device = self.active.as_ref().ok_or_else(not_selected)?;
        debug!("Enabling serial port service on {}", device.address);
        self.backend.enable_serial_service(device)
    }

    /// COM port the OS assigned to the active device, if any.
    pub fn get_serial_port_name(&mut self) -> Result<Option<String>> {
        let address = self.active.as_ref().ok_or_else(not_selected)?.address;
        let entries = self.backend.serial_ports()?;
        let port = find_port_name(&entries, address);
        match &port {
            Some(name) => info!("Card {} is on {}", address, name),
            None => warn!("No serial port registered for {}", address),
        }
        Ok(port)
    }

    /// Pair, enable the serial service and resolve the port, as one step.
    pub fn client_connect(&mut self) -> Result<String> {
        let pin = self.config.pin.clone();
        self.pair(&pin)?;
        self.enable_serial_port()?;
        self.get_serial_port_name()?.ok_or_else(|| {
            CardError::ConnectionFailed("no serial port assigned to the card".to_string())
        })
    }

    /// [`Self::client_connect`] with one remove-and-retry cycle when the OS
    /// denies access to a stale pairing.
    pub fn connect(&mut self) -> Result<String> {
        match self.client_connect() {
            Err(CardError::AccessDenied(who)) => {
                warn!("Access denied by {}, removing device and retrying", who);
                self.remove_device()?;
                self.client_connect()
            }
            other => other,
        }
    }

    /// Forget the active device, or every candidate when none is active.
    pub fn remove_device(&mut self) -> Result<()> {
        let targets: Vec<BluetoothAddress> = match self.active.take() {
            Some(device) => vec![device.address],
            None => self.candidates.iter().map(|d| d.address).collect(),
        };
        for address in targets {
            info!("Removing device {}", address);
            self.backend.remove_device(address)?;
            if let Some(c) = self.candidates.iter_mut().find(|c| c.address == address) {
                c.authenticated = false;
            }
        }
        Ok(())
    }

    fn select_adapter(&mut self) -> Result<()> {
        if self.adapter_selected {
            return Ok(());
        }
        if let Some(adapter) = self.config.adapter_address {
            info!("Using local adapter {}", adapter);
            self.backend.select_adapter(adapter)?;
        }
        self.adapter_selected = true;
        Ok(())
    }

    fn paired_addresses(&mut self) -> Result<HashSet<BluetoothAddress>> {
        Ok(self
            .backend
            .paired_devices()?
            .into_iter()
            .filter(|d| d.authenticated)
            .map(|d| d.address)
            .collect())
    }
}

fn not_selected() -> CardError {
    CardError::NotPaired("no active device".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::fake::{access_denied, card, FakeBackend};
    use crate::infrastructure::bluetooth::registry::SerialPortEntry;

    const CARD: u64 = 0x001A_7DDA_7113;

    fn session(backend: &FakeBackend, pairing: PairingStrategy) -> BluetoothSession<FakeBackend> {
        let config = SessionConfig {
            pin: "1234".into(),
            pairing,
            ..SessionConfig::default()
        };
        BluetoothSession::new(backend.clone(), config).unwrap()
    }

    fn backend_with_port() -> FakeBackend {
        let backend = FakeBackend::with_devices(vec![card(CARD, 0x1F00, "GateKeeper")]);
        backend.state.lock().unwrap().ports = vec![SerialPortEntry::new(
            "BTHENUM\\{00001101}\\7&1&001A7DDA7113_C00000000",
            "Standard Serial over Bluetooth link (COM4)",
        )];
        backend
    }

    #[test]
    fn test_check_device_list_empty() {
        let backend = FakeBackend::default();
        let mut s = session(&backend, PairingStrategy::default());
        assert!(matches!(s.check_device_list(), Err(CardError::DeviceSearchFailed)));
    }

    #[test]
    fn test_check_device_list_requires_pairing() {
        let backend = FakeBackend::with_devices(vec![card(CARD, 0x1F00, "GateKeeper")]);
        let mut s = session(&backend, PairingStrategy::default());
        assert!(matches!(s.check_device_list(), Err(CardError::NotPaired(_))));

        backend.state.lock().unwrap().paired.push(BluetoothAddress(CARD));
        assert_eq!(s.check_device_list().unwrap().address.0, CARD);
    }

    #[test]
    fn test_pair_uses_pin_and_skips_paired() {
        let backend = FakeBackend::with_devices(vec![
            card(1, 0x1F00, "A"),
            card(2, 0x1F00, "B"),
        ]);
        backend.state.lock().unwrap().paired.push(BluetoothAddress(1));
        let mut s = session(&backend, PairingStrategy::default());

        s.pair("1234").unwrap();
        let state = backend.state.lock().unwrap();
        assert_eq!(state.pair_calls, vec![(BluetoothAddress(2), "1234".to_string())]);
        assert_eq!(s.active_device().unwrap().address.0, 1);
    }

    #[test]
    fn test_rejected_pairing_retries_pass() {
        let backend = FakeBackend::with_devices(vec![card(CARD, 0x1F00, "GateKeeper")]);
        backend.state.lock().unwrap().pair_script.push_back(Ok(PairResult::Rejected));
        let mut s = session(&backend, PairingStrategy::Retry { max_retries: 1 });

        s.pair("1234").unwrap();
        assert_eq!(backend.state.lock().unwrap().pair_calls.len(), 2);
        assert!(s.active_device().is_some());
    }

    #[test]
    fn test_retry_budget_exhausted() {
        let backend = FakeBackend::with_devices(vec![card(CARD, 0x1F00, "GateKeeper")]);
        {
            let mut state = backend.state.lock().unwrap();
            state.pair_script.push_back(Ok(PairResult::Rejected));
            state.pair_script.push_back(Ok(PairResult::Rejected));
        }
        let mut s = session(&backend, PairingStrategy::Retry { max_retries: 1 });
        assert!(matches!(
            s.pair("1234"),
            Err(CardError::AuthenticationFailed { .. })
        ));
    }

    #[test]
    fn test_skip_failed_moves_on() {
        let backend = FakeBackend::with_devices(vec![
            card(1, 0x1F00, "A"),
            card(2, 0x1F00, "B"),
        ]);
        backend.state.lock().unwrap().pair_script.push_back(Ok(PairResult::Rejected));
        let mut s = session(&backend, PairingStrategy::SkipFailed);

        s.pair("1234").unwrap();
        assert_eq!(s.active_device().unwrap().address.0, 2);
        assert_eq!(backend.state.lock().unwrap().pair_calls.len(), 2);
    }

    #[test]
    fn test_client_connect_resolves_port() {
        let backend = backend_with_port();
        let mut s = session(&backend, PairingStrategy::default());
        assert_eq!(s.client_connect().unwrap(), "COM4");
        assert_eq!(backend.state.lock().unwrap().enabled, vec![BluetoothAddress(CARD)]);
    }

    #[test]
    fn test_access_denied_removes_and_retries_once() {
        let backend = backend_with_port();
        backend.state.lock().unwrap().pair_script.push_back(access_denied(CARD));
        let mut s = session(&backend, PairingStrategy::default());

        assert_eq!(s.connect().unwrap(), "COM4");
        assert_eq!(backend.state.lock().unwrap().removed, vec![BluetoothAddress(CARD)]);
    }

    #[test]
    fn test_access_denied_twice_propagates() {
        let backend = backend_with_port();
        {
            let mut state = backend.state.lock().unwrap();
            state.pair_script.push_back(access_denied(CARD));
            state.pair_script.push_back(access_denied(CARD));
        }
        let mut s = session(&backend, PairingStrategy::default());
        assert!(matches!(s.connect(), Err(CardError::AccessDenied(_))));
        assert_eq!(backend.state.lock().unwrap().removed.len(), 1);
    }

    #[test]
    fn test_configured_adapter_reaches_backend() {
        let backend = FakeBackend::with_devices(vec![card(CARD, 0x1F00, "GateKeeper")]);
        let adapter = BluetoothAddress(0x0011_2233_4455);
        let config = SessionConfig {
            adapter_address: Some(adapter),
            ..SessionConfig::default()
        };
        let mut s = BluetoothSession::new(backend.clone(), config).unwrap();
        s.rediscover().unwrap();
        assert_eq!(backend.state.lock().unwrap().adapters, vec![adapter]);
        assert_eq!(s.candidates().len(), 1);
    }

    #[test]
    fn test_adapter_from_settings() {
        let mut settings = Settings::default();
        settings.adapter_address = Some("00:11:22:33:44:55".into());
        let config = SessionConfig::from_settings(&settings);
        assert_eq!(config.adapter_address, Some(BluetoothAddress(0x0011_2233_4455)));

        let backend = FakeBackend::default();
        let mut s = BluetoothSession::deferred(backend.clone(), config);
        assert!(backend.state.lock().unwrap().adapters.is_empty());
        s.rediscover().unwrap();
        assert_eq!(
            backend.state.lock().unwrap().adapters,
            vec![BluetoothAddress(0x0011_2233_4455)]
        );
    }

    #[test]
    fn test_no_adapter_uses_default_radio() {
        let backend = FakeBackend::with_devices(vec![card(CARD, 0x1F00, "GateKeeper")]);
        let _s = session(&backend, PairingStrategy::default());
        assert!(backend.state.lock().unwrap().adapters.is_empty());
    }

    #[test]
    fn test_missing_port_is_connection_failure() {
        let backend = FakeBackend::with_devices(vec![card(CARD, 0x1F00, "GateKeeper")]);
        let mut s = session(&backend, PairingStrategy::default());
        assert!(matches!(s.client_connect(), Err(CardError::ConnectionFailed(_))));
    }
}
