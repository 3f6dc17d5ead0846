//! Win32 classic Bluetooth backend.

use super::registry::{query_serial_ports, SerialPortEntry};
use super::{BluetoothBackend, PairResult};
use crate::domain::error::{CardError, Result};
use crate::domain::models::{BluetoothAddress, DeviceInfo};
use std::time::Duration;
use tracing::{debug, info, warn};
use windows::Win32::Devices::Bluetooth::{
    BluetoothAuthenticateDevice, BluetoothFindDeviceClose, BluetoothFindFirstDevice,
    BluetoothFindFirstRadio, BluetoothFindNextDevice, BluetoothFindNextRadio,
    BluetoothFindRadioClose, BluetoothGetRadioInfo, BluetoothRemoveDevice,
    BluetoothSetServiceState, SerialPortServiceClass_UUID, BLUETOOTH_ADDRESS, BLUETOOTH_ADDRESS_0,
    BLUETOOTH_DEVICE_INFO, BLUETOOTH_DEVICE_SEARCH_PARAMS, BLUETOOTH_FIND_RADIO_PARAMS,
    BLUETOOTH_RADIO_INFO,
};
use windows::Win32::Foundation::{
    CloseHandle, ERROR_ACCESS_DENIED, ERROR_NO_MORE_ITEMS, ERROR_SUCCESS, HANDLE,
};

/// Inquiry timeouts are expressed in units of 1.28 seconds, at most 48.
const INQUIRY_UNIT_MS: u128 = 1280;
const MAX_INQUIRY_UNITS: u128 = 48;

const BLUETOOTH_SERVICE_ENABLE: u32 = 0x01;

/// Owned handle to a local radio.
#[derive(Debug)]
struct Radio(HANDLE);

// SAFETY: radio handles are kernel handles usable from any thread.
unsafe impl Send for Radio {}

impl Drop for Radio {
    fn drop(&mut self) {
        // SAFETY: the handle came from the radio enumeration and is closed once.
        if let Err(e) = unsafe { CloseHandle(self.0) } {
            debug!("Closing radio handle: {}", e);
        }
    }
}

#[derive(Debug, Default)]
pub struct WinBluetooth {
    radio: Option<Radio>,
}

impl WinBluetooth {
    pub fn new() -> Self {
        Self::default()
    }

    /// The selected radio, or a null handle meaning "any radio".
    fn radio_handle(&self) -> HANDLE {
        self.radio.as_ref().map(|r| r.0).unwrap_or_default()
    }

    fn selected_radio(&self) -> Option<HANDLE> {
        self.radio.as_ref().map(|r| r.0)
    }

    fn find_devices(&self, params: BLUETOOTH_DEVICE_SEARCH_PARAMS) -> Result<Vec<DeviceInfo>> {
        let mut info = device_info_struct();
        let mut devices = Vec::new();

        // SAFETY: both structs carry their dwSize and outlive the calls.
        let find = match unsafe { BluetoothFindFirstDevice(&params, &mut info) } {
            Ok(handle) => handle,
            Err(e) if e.code() == ERROR_NO_MORE_ITEMS.to_hresult() => return Ok(devices),
            Err(e) => {
                warn!("Bluetooth device search failed: {}", e);
                return Err(CardError::BluetoothUnavailable);
            }
        };

        loop {
            devices.push(to_device_info(&info));
            info = device_info_struct();
            // SAFETY: `find` is a live search handle.
            if unsafe { BluetoothFindNextDevice(find, &mut info) }.is_err() {
                break;
            }
        }
        // SAFETY: closes the handle opened above exactly once.
        if let Err(e) = unsafe { BluetoothFindDeviceClose(find) } {
            debug!("Closing device search: {}", e);
        }
        Ok(devices)
    }
}

impl BluetoothBackend for WinBluetooth {
    fn select_adapter(&mut self, address: BluetoothAddress) -> Result<()> {
        let params = BLUETOOTH_FIND_RADIO_PARAMS {
            dwSize: std::mem::size_of::<BLUETOOTH_FIND_RADIO_PARAMS>() as u32,
        };
        let mut handle = HANDLE::default();
        // SAFETY: `params` carries its dwSize and `handle` outlives the call.
        let find = match unsafe { BluetoothFindFirstRadio(&params, &mut handle) } {
            Ok(find) => find,
            Err(e) => {
                warn!("No local Bluetooth radio: {}", e);
                return Err(CardError::BluetoothUnavailable);
            }
        };

        let mut selected = None;
        loop {
            let radio = Radio(handle);
            if radio_address(&radio) == Some(address) {
                selected = Some(radio);
                break;
            }
            drop(radio);
            handle = HANDLE::default();
            // SAFETY: `find` is a live radio enumeration handle.
            if unsafe { BluetoothFindNextRadio(find, &mut handle) }.is_err() {
                break;
            }
        }
        // SAFETY: closes the enumeration opened above exactly once.
        if let Err(e) = unsafe { BluetoothFindRadioClose(find) } {
            debug!("Closing radio search: {}", e);
        }

        match selected {
            Some(radio) => {
                info!("Selected local radio {}", address);
                self.radio = Some(radio);
                Ok(())
            }
            None => {
                warn!("No local radio with address {}", address);
                Err(CardError::BluetoothUnavailable)
            }
        }
    }

    fn discover(&mut self, timeout: Duration) -> Result<Vec<DeviceInfo>> {
        let units = (timeout.as_millis().div_ceil(INQUIRY_UNIT_MS)).clamp(1, MAX_INQUIRY_UNITS) as u8;
        let params = BLUETOOTH_DEVICE_SEARCH_PARAMS {
            dwSize: std::mem::size_of::<BLUETOOTH_DEVICE_SEARCH_PARAMS>() as u32,
            fReturnAuthenticated: true.into(),
            fReturnRemembered: true.into(),
            fReturnUnknown: true.into(),
            fReturnConnected: true.into(),
            fIssueInquiry: true.into(),
            cTimeoutMultiplier: units,
            hRadio: self.radio_handle(),
            ..Default::default()
        };
        self.find_devices(params)
    }

    fn paired_devices(&mut self) -> Result<Vec<DeviceInfo>> {
        let params = BLUETOOTH_DEVICE_SEARCH_PARAMS {
            dwSize: std::mem::size_of::<BLUETOOTH_DEVICE_SEARCH_PARAMS>() as u32,
            fReturnAuthenticated: true.into(),
            fReturnRemembered: true.into(),
            hRadio: self.radio_handle(),
            ..Default::default()
        };
        self.find_devices(params)
    }

    fn pair_request(&mut self, device: &DeviceInfo, pin: &str) -> Result<PairResult> {
        let mut info = device_info_for(device);
        let passkey: Vec<u16> = pin.encode_utf16().collect();

        // SAFETY: `info` is initialised and the passkey slice outlives the call.
        let code = unsafe { BluetoothAuthenticateDevice(None, self.selected_radio(), &mut info, Some(&passkey)) };
        match code {
            c if c == ERROR_SUCCESS.0 || c == ERROR_NO_MORE_ITEMS.0 => Ok(PairResult::Paired),
            c if c == ERROR_ACCESS_DENIED.0 => Err(CardError::AccessDenied(device.address.to_string())),
            c => {
                warn!("Pairing with {} returned error {}", device.address, c);
                Ok(PairResult::Rejected)
            }
        }
    }

    fn enable_serial_service(&mut self, device: &DeviceInfo) -> Result<()> {
        let info = device_info_for(device);
        // SAFETY: pointers reference locals valid for the duration of the call.
        let code = unsafe {
            BluetoothSetServiceState(
                self.selected_radio(),
                &info,
                &SerialPortServiceClass_UUID,
                BLUETOOTH_SERVICE_ENABLE,
            )
        };
        if code != ERROR_SUCCESS.0 {
            return Err(CardError::ConnectionFailed(format!(
                "enabling serial service on {} failed with error {}",
                device.address, code
            )));
        }
        info!("Serial port service enabled on {}", device.address);
        Ok(())
    }

    fn remove_device(&mut self, address: BluetoothAddress) -> Result<()> {
        let addr = to_win_address(address);
        // SAFETY: `addr` is a valid address struct.
        let code = unsafe { BluetoothRemoveDevice(&addr) };
        if code != ERROR_SUCCESS.0 {
            warn!("Removing {} returned error {}", address, code);
        }
        Ok(())
    }

    fn serial_ports(&mut self) -> Result<Vec<SerialPortEntry>> {
        query_serial_ports()
    }
}

fn radio_address(radio: &Radio) -> Option<BluetoothAddress> {
    let mut info = BLUETOOTH_RADIO_INFO {
        dwSize: std::mem::size_of::<BLUETOOTH_RADIO_INFO>() as u32,
        ..Default::default()
    };
    // SAFETY: `info` carries its dwSize and the handle is open.
    if unsafe { BluetoothGetRadioInfo(radio.0, &mut info) } != ERROR_SUCCESS.0 {
        return None;
    }
    // SAFETY: every variant of the address union is a view of the same 8 bytes.
    let raw = unsafe { info.address.Anonymous.ullLong };
    Some(BluetoothAddress(raw & 0xFFFF_FFFF_FFFF))
}

fn device_info_struct() -> BLUETOOTH_DEVICE_INFO {
    BLUETOOTH_DEVICE_INFO {
        dwSize: std::mem::size_of::<BLUETOOTH_DEVICE_INFO>() as u32,
        ..Default::default()
    }
}

fn device_info_for(device: &DeviceInfo) -> BLUETOOTH_DEVICE_INFO {
    BLUETOOTH_DEVICE_INFO {
        Address: to_win_address(device.address),
        ulClassofDevice: device.class_of_device,
        ..device_info_struct()
    }
}

fn to_win_address(address: BluetoothAddress) -> BLUETOOTH_ADDRESS {
    BLUETOOTH_ADDRESS {
        Anonymous: BLUETOOTH_ADDRESS_0 { ullLong: address.0 },
    }
}

fn to_device_info(info: &BLUETOOTH_DEVICE_INFO) -> DeviceInfo {
    let name_len = info.szName.iter().position(|c| *c == 0).unwrap_or(info.szName.len());
    // SAFETY: every bit pattern of the union is a valid u64.
    let address = unsafe { info.Address.Anonymous.ullLong } & 0xFFFF_FFFF_FFFF;
    DeviceInfo {
        address: BluetoothAddress(address),
        class_of_device: info.ulClassofDevice,
        name: String::from_utf16_lossy(&info.szName[..name_len]),
        authenticated: info.fAuthenticated.as_bool(),
        remembered: info.fRemembered.as_bool(),
        connected: info.fConnected.as_bool(),
    }
}
