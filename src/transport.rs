//! Device discovery and raw report I/O.
//!
//! Every backend supplies the same four operations behind the [`Transport`]
//! trait; the session never touches a device any other way. Backends are
//! produced by [`DeviceProvider`]s held in a process-global registry and
//! enumerated in registration order. The crate ships a hidapi-backed
//! provider for USB HID authenticators; NFC and platform-proxy providers
//! can be registered by the embedder.

use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::sync::{Mutex, OnceLock};

use crate::error::{Error, Result};

/// FIDO alliance HID usage page and usage for CTAPHID interfaces.
const FIDO_USAGE_PAGE: u16 = 0xF1D0;
const FIDO_USAGE: u16 = 0x01;

/// Raw report I/O over one device.
///
/// `read` honours the CTAPHID timeout convention: `-1` blocks
/// indefinitely, `0` polls once, anything else is a budget in
/// milliseconds. A `read` that expires returns `Ok(0)`.
pub trait Transport: Send {
    fn open(&mut self, path: &str) -> Result<()>;
    fn close(&mut self);
    fn read(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
}

/// Device information structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

/// A source of FIDO devices: one platform enumeration backend.
pub trait DeviceProvider: Send {
    fn name(&self) -> &str;
    fn list(&self) -> Result<Vec<DeviceInfo>>;
    fn open(&self, path: &str) -> Result<Box<dyn Transport>>;
}

fn registry() -> &'static Mutex<Vec<Box<dyn DeviceProvider>>> {
    static REGISTRY: OnceLock<Mutex<Vec<Box<dyn DeviceProvider>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Appends a provider to the global registry. Enumeration and open
/// attempts run over providers in insertion order.
pub fn register_provider(provider: Box<dyn DeviceProvider>) {
    let mut providers = registry().lock().unwrap();
    log::debug!("Registering device provider: {}", provider.name());
    providers.push(provider);
}

/// Flushes the provider registry.
pub fn clear_providers() {
    registry().lock().unwrap().clear();
}

/// List all FIDO devices known to the registered providers.
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    let providers = registry().lock().unwrap();
    let mut all_devices = Vec::new();
    for provider in providers.iter() {
        match provider.list() {
            Ok(devices) => all_devices.extend(devices),
            Err(e) => {
                log::error!("Provider {} failed to enumerate: {}", provider.name(), e);
            }
        }
    }
    log::debug!("Total devices found: {}", all_devices.len());
    Ok(all_devices)
}

/// Opens a transport for `path`, preferring the provider that listed it
/// and falling back to each remaining provider in order.
pub fn open_path(path: &str) -> Result<Box<dyn Transport>> {
    let providers = registry().lock().unwrap();
    for provider in providers.iter() {
        let listed = provider
            .list()
            .map(|devices| devices.iter().any(|d| d.path == path))
            .unwrap_or(false);
        if listed {
            let mut transport = provider.open(path)?;
            transport.open(path)?;
            return Ok(transport);
        }
    }
    for provider in providers.iter() {
        if let Ok(mut transport) = provider.open(path) {
            if transport.open(path).is_ok() {
                return Ok(transport);
            }
        }
    }
    Err(Error::NotFidoDevice)
}

fn hid_api() -> Result<&'static Mutex<hidapi::HidApi>> {
    static API: OnceLock<std::result::Result<Mutex<hidapi::HidApi>, String>> = OnceLock::new();
    match API.get_or_init(|| hidapi::HidApi::new().map(Mutex::new).map_err(|e| e.to_string())) {
        Ok(api) => Ok(api),
        Err(e) => Err(Error::Tx(format!("failed to initialize HID API: {}", e))),
    }
}

/// The default USB HID provider.
pub struct HidapiProvider;

impl DeviceProvider for HidapiProvider {
    fn name(&self) -> &str {
        "hidapi"
    }

    fn list(&self) -> Result<Vec<DeviceInfo>> {
        log::debug!("Enumerating HID devices...");
        let mut api = hid_api()?.lock().unwrap();
        api.refresh_devices()
            .map_err(|e| Error::Rx(format!("failed to refresh HID device list: {}", e)))?;

        let mut devices = Vec::new();
        for device_info in api.device_list() {
            // Only CTAPHID interfaces carry the FIDO usage page.
            if device_info.usage_page() != FIDO_USAGE_PAGE || device_info.usage() != FIDO_USAGE {
                continue;
            }

            let device = DeviceInfo {
                path: device_info.path().to_string_lossy().to_string(),
                vendor_id: device_info.vendor_id(),
                product_id: device_info.product_id(),
                manufacturer: device_info.manufacturer_string().map(|s| s.to_string()),
                product: device_info.product_string().map(|s| s.to_string()),
            };

            log::info!(
                "Found FIDO device: {} - VID: 0x{:04x}, PID: 0x{:04x}, Path: {}",
                device.product.as_deref().unwrap_or("Unknown"),
                device.vendor_id,
                device.product_id,
                device.path
            );
            devices.push(device);
        }

        log::debug!("Found {} FIDO HID devices", devices.len());
        Ok(devices)
    }

    fn open(&self, _path: &str) -> Result<Box<dyn Transport>> {
        Ok(Box::new(HidapiTransport { device: None }))
    }
}

/// USB HID transport backed by hidapi.
pub struct HidapiTransport {
    device: Option<hidapi::HidDevice>,
}

impl Transport for HidapiTransport {
    fn open(&mut self, path: &str) -> Result<()> {
        if self.device.is_some() {
            return Err(Error::InvalidState);
        }
        let api = hid_api()?.lock().unwrap();
        let cpath = CString::new(path.as_bytes()).map_err(|_| Error::InvalidArgument)?;
        let device = api.open_path(&cpath).map_err(|e| {
            Error::Tx(format!(
                "failed to open HID device at {}: {}. The device may be in use \
                 by another application, or additional permissions may be required",
                path, e
            ))
        })?;
        log::debug!("Opened HID device by path: {}", path);
        self.device = Some(device);
        Ok(())
    }

    fn close(&mut self) {
        self.device = None;
    }

    fn read(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        let device = self.device.as_ref().ok_or(Error::InvalidState)?;
        let n = device
            .read_timeout(buf, timeout_ms)
            .map_err(|e| Error::Rx(format!("failed to read HID report: {}", e)))?;
        if n > 0 {
            log::trace!("HID report in: {:02X?}", &buf[..n]);
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let device = self.device.as_ref().ok_or(Error::InvalidState)?;
        // hidapi wants the report id in front; CTAPHID uses unnumbered
        // reports, so it is always zero.
        let mut report = Vec::with_capacity(buf.len() + 1);
        report.push(0u8);
        report.extend_from_slice(buf);
        let n = device
            .write(&report)
            .map_err(|e| Error::Tx(format!("failed to write HID report: {}", e)))?;
        log::trace!("HID report out: {:02X?}", buf);
        if n < report.len() {
            return Err(Error::Tx(format!("short HID write: {} bytes", n)));
        }
        Ok(buf.len())
    }
}
