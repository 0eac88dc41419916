//! The device session: one opened transport, one channel id, one set of
//! negotiated capabilities, and the cached pinUvAuthToken. All CTAP2
//! traffic funnels through [`Session::cbor_call`], which owns status-byte
//! mapping and token-cache hygiene.

use zeroize::Zeroizing;

use crate::cbor::{self, Value};
use crate::error::{Error, Result};
use crate::hid;
use crate::info::AuthenticatorInfo;
use crate::pin::PinUvAuthProtocol;
use crate::transport::{self, DeviceInfo, Transport};

/// CTAP2 command codes
pub(crate) const CTAP2_MAKE_CREDENTIAL: u8 = 0x01;
pub(crate) const CTAP2_GET_ASSERTION: u8 = 0x02;
pub(crate) const CTAP2_GET_INFO: u8 = 0x04;
pub(crate) const CTAP2_CLIENT_PIN: u8 = 0x06;
pub(crate) const CTAP2_RESET: u8 = 0x07;
pub(crate) const CTAP2_GET_NEXT_ASSERTION: u8 = 0x08;
pub(crate) const CTAP2_BIO_ENROLLMENT: u8 = 0x09;
pub(crate) const CTAP2_CREDENTIAL_MANAGEMENT: u8 = 0x0A;
pub(crate) const CTAP2_SELECTION: u8 = 0x0B;
pub(crate) const CTAP2_LARGE_BLOBS: u8 = 0x0C;
pub(crate) const CTAP2_CONFIG: u8 = 0x0D;
pub(crate) const CTAP2_BIO_ENROLLMENT_PRE: u8 = 0x40;
pub(crate) const CTAP2_CREDENTIAL_MANAGEMENT_PRE: u8 = 0x41;

const DEFAULT_TIMEOUT_MS: i32 = 15_000;

/// A session with one authenticator.
///
/// Operations are serialized: a command issued while another is in
/// flight fails with [`Error::Busy`]. The cached pinUvAuthToken is wiped
/// on close and whenever the authenticator signals it has become stale.
pub struct Session {
    transport: Option<Box<dyn Transport>>,
    opened: bool,
    cid: u32,
    protocol: u8,
    version_major: u8,
    version_minor: u8,
    version_build: u8,
    caps: u8,
    info: Option<AuthenticatorInfo>,
    timeout_ms: i32,
    in_flight: bool,
    pub(crate) token: Option<Zeroizing<Vec<u8>>>,
    pub(crate) token_protocol: Option<PinUvAuthProtocol>,
    #[cfg(test)]
    test_nonce: Option<[u8; 8]>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Session {
            transport: None,
            opened: false,
            cid: 0,
            protocol: 0,
            version_major: 0,
            version_minor: 0,
            version_build: 0,
            caps: 0,
            info: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            in_flight: false,
            token: None,
            token_protocol: None,
            #[cfg(test)]
            test_nonce: None,
        }
    }

    /// Installs a caller-supplied transport in place of the provider
    /// registry. Rejected while a device is open.
    pub fn set_transport(&mut self, transport: Box<dyn Transport>) -> Result<()> {
        if self.opened {
            return Err(Error::InvalidState);
        }
        self.transport = Some(transport);
        Ok(())
    }

    /// Opens the device at `path` and performs the INIT handshake. When
    /// the authenticator reports CBOR capability, getInfo runs as part of
    /// the open so capabilities are known before the first command.
    pub fn open(&mut self, path: &str) -> Result<()> {
        if self.opened {
            return Err(Error::InvalidState);
        }
        if self.transport.is_none() {
            self.transport = Some(transport::open_path(path)?);
        } else if let Some(t) = self.transport.as_mut() {
            t.open(path)?;
        }

        log::info!("Opening FIDO device: {}", path);
        match self.handshake() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.opened = false;
                self.cid = 0;
                self.info = None;
                if let Some(t) = self.transport.as_mut() {
                    t.close();
                }
                Err(e)
            }
        }
    }

    pub fn open_with_info(&mut self, device: &DeviceInfo) -> Result<()> {
        self.open(&device.path)
    }

    fn handshake(&mut self) -> Result<()> {
        let nonce = self.handshake_nonce();
        let transport = self.transport.as_mut().ok_or(Error::InvalidState)?;
        let reply = hid::init(transport.as_mut(), nonce, self.timeout_ms)?;
        if reply.nonce != nonce {
            return Err(Error::Rx("INIT nonce mismatch".to_string()));
        }

        self.cid = reply.cid;
        self.protocol = reply.protocol;
        self.version_major = reply.major;
        self.version_minor = reply.minor;
        self.version_build = reply.build;
        self.caps = reply.caps;
        self.opened = true;
        log::debug!(
            "Channel 0x{:08x} assigned, protocol {} caps 0x{:02x}",
            self.cid,
            self.protocol,
            self.caps
        );

        if self.is_fido2() {
            match self.cbor_call(CTAP2_GET_INFO, None)? {
                Some(Value::Map(map)) => {
                    self.info = Some(AuthenticatorInfo::parse(&map));
                }
                _ => return Err(Error::RxInvalidCbor),
            }
        }
        Ok(())
    }

    fn handshake_nonce(&self) -> [u8; 8] {
        #[cfg(test)]
        if let Some(nonce) = self.test_nonce {
            return nonce;
        }
        rand::random()
    }

    /// Releases the device and wipes all per-session secrets.
    pub fn close(&mut self) {
        self.clear_token();
        if let Some(t) = self.transport.as_mut() {
            t.close();
        }
        self.opened = false;
        self.cid = 0;
        self.caps = 0;
        self.info = None;
    }

    /// Fire-and-forget CANCEL on the current channel. Before a channel
    /// has been negotiated the frame goes to the broadcast channel; not
    /// every authenticator honours that, so no reply is awaited either
    /// way. The outstanding operation fails with `UserCanceled` once the
    /// authenticator reacts.
    pub fn cancel(&mut self) -> Result<()> {
        let cid = if self.opened {
            self.cid
        } else {
            hid::CID_BROADCAST
        };
        let transport = self.transport.as_mut().ok_or(Error::InvalidState)?;
        hid::send(transport.as_mut(), cid, hid::CMD_CANCEL, &[])
    }

    /// Clears the CBOR capability bit, forcing workflows down the legacy
    /// U2F path.
    pub fn force_u2f(&mut self) {
        self.caps &= !hid::CAP_CBOR;
    }

    /// Restores the CBOR capability bit.
    pub fn force_fido2(&mut self) {
        self.caps |= hid::CAP_CBOR;
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    pub fn is_fido2(&self) -> bool {
        self.caps & hid::CAP_CBOR != 0
    }

    pub fn is_winkable(&self) -> bool {
        self.caps & hid::CAP_WINK != 0
    }

    pub fn cid(&self) -> u32 {
        self.cid
    }

    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    pub fn version(&self) -> (u8, u8, u8) {
        (self.version_major, self.version_minor, self.version_build)
    }

    pub fn flags(&self) -> u8 {
        self.caps
    }

    pub fn info(&self) -> Option<&AuthenticatorInfo> {
        self.info.as_ref()
    }

    /// Per-operation timeout in milliseconds; `-1` blocks indefinitely,
    /// `0` polls once.
    pub fn set_timeout(&mut self, timeout_ms: i32) {
        self.timeout_ms = timeout_ms;
    }

    pub(crate) fn timeout_ms(&self) -> i32 {
        self.timeout_ms
    }

    /// Blinks the authenticator.
    pub fn wink(&mut self) -> Result<()> {
        if !self.is_winkable() {
            return Err(Error::UnsupportedOption);
        }
        self.hid_txn(hid::CMD_WINK, &[]).map(|_| ())
    }

    /// Asks the authenticator to signal selection (user touch).
    pub fn selection(&mut self) -> Result<()> {
        self.cbor_call(CTAP2_SELECTION, None).map(|_| ())
    }

    /// Factory-resets the authenticator. Must be issued shortly after
    /// power-up; most devices additionally require a touch.
    pub fn reset(&mut self) -> Result<()> {
        self.cbor_call(CTAP2_RESET, None)?;
        self.clear_token();
        Ok(())
    }

    pub(crate) fn clear_token(&mut self) {
        self.token = None;
        self.token_protocol = None;
    }

    /// One CTAPHID exchange with busy and open-state guards.
    fn hid_txn(&mut self, cmd: u8, payload: &[u8]) -> Result<Vec<u8>> {
        if !self.opened {
            return Err(Error::InvalidState);
        }
        if self.in_flight {
            return Err(Error::Busy);
        }
        self.in_flight = true;
        let transport = match self.transport.as_mut() {
            Some(t) => t,
            None => {
                self.in_flight = false;
                return Err(Error::InvalidState);
            }
        };
        let result = hid::txn(transport.as_mut(), self.cid, cmd, payload, self.timeout_ms);
        self.in_flight = false;
        result
    }

    /// Issues one CTAP2 command: `cmd || canonical CBOR` out,
    /// `status || CBOR?` back. Non-zero status maps straight into the
    /// error taxonomy; statuses that imply a stale pinUvAuthToken also
    /// drop the cache.
    pub(crate) fn cbor_call(&mut self, cmd: u8, params: Option<&Value>) -> Result<Option<Value>> {
        let mut payload = vec![cmd];
        if let Some(p) = params {
            payload.extend_from_slice(&cbor::encode(p)?);
        }

        log::debug!("CTAP2 command 0x{:02x}, {} byte request", cmd, payload.len());
        let reply = self.hid_txn(hid::CMD_CBOR, &payload)?;
        if reply.is_empty() {
            return Err(Error::Rx("empty CTAP2 reply".to_string()));
        }

        let status = reply[0];
        if status != 0 {
            let err = Error::from_status(status);
            log::debug!("CTAP2 command 0x{:02x} failed: {}", cmd, err);
            if err.invalidates_token() {
                self.clear_token();
            }
            return Err(err);
        }
        if reply.len() == 1 {
            return Ok(None);
        }
        let (value, _) = cbor::decode(&reply[1..]).map_err(|_| Error::RxInvalidCbor)?;
        Ok(Some(value))
    }

    /// Issues one U2F APDU over CTAPHID MSG frames.
    pub(crate) fn msg_call(&mut self, apdu: &[u8]) -> Result<Vec<u8>> {
        self.hid_txn(hid::CMD_MSG, apdu)
    }

    #[cfg(test)]
    pub(crate) fn set_test_nonce(&mut self, nonce: [u8; 8]) {
        self.test_nonce = Some(nonce);
    }

    #[cfg(test)]
    pub(crate) fn set_in_flight(&mut self, in_flight: bool) {
        self.in_flight = in_flight;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
