//! The pinUvAuthProtocol engine: ECDH key agreement with the
//! authenticator, shared-secret derivation, PIN set/change, and
//! pinUvAuthToken acquisition with permissions.
//!
//! Protocol 1 derives a single 32-byte secret (SHA-256 of the ECDH X
//! coordinate) used for both encryption and authentication; protocol 2
//! derives separate HMAC and AES keys through HKDF and prepends a random
//! IV to every ciphertext.

use aes::Aes256;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cbc::{Decryptor, Encryptor};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::elliptic_curve::generic_array::GenericArray;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{ecdh::EphemeralSecret, EncodedPoint, PublicKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::cbor::{self, cbor_to_bool, cbor_to_bytes, cbor_to_u8, int, map_get, Value};
use crate::error::{Error, Result};
use crate::session::{Session, CTAP2_CLIENT_PIN};

type Aes256CbcEnc = Encryptor<Aes256>;
type Aes256CbcDec = Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Client PIN subcommands
const PIN_GET_RETRIES: u8 = 0x01;
const PIN_GET_KEY_AGREEMENT: u8 = 0x02;
const PIN_SET_PIN: u8 = 0x03;
const PIN_CHANGE_PIN: u8 = 0x04;
const PIN_GET_PIN_TOKEN: u8 = 0x05;
const PIN_GET_PIN_UV_AUTH_TOKEN_USING_UV_WITH_PERMISSIONS: u8 = 0x06;
const PIN_GET_UV_RETRIES: u8 = 0x07;
const PIN_GET_PIN_UV_AUTH_TOKEN_USING_PIN_WITH_PERMISSIONS: u8 = 0x09;

/// pinUvAuthToken permission bits.
pub mod permissions {
    pub const MAKE_CREDENTIAL: u8 = 0x01;
    pub const GET_ASSERTION: u8 = 0x02;
    pub const CREDENTIAL_MANAGEMENT: u8 = 0x04;
    pub const BIO_ENROLLMENT: u8 = 0x08;
    pub const LARGE_BLOB_WRITE: u8 = 0x10;
    pub const AUTHENTICATOR_CONFIG: u8 = 0x20;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PinUvAuthProtocol {
    One,
    Two,
}

impl PinUvAuthProtocol {
    pub fn number(self) -> u8 {
        match self {
            PinUvAuthProtocol::One => 1,
            PinUvAuthProtocol::Two => 2,
        }
    }
}

/// Picks the strongest protocol the authenticator advertises.
pub(crate) fn select_protocol(dev: &Session) -> PinUvAuthProtocol {
    let protocols = dev
        .info()
        .map(|i| i.pin_protocols.clone())
        .unwrap_or_default();
    if protocols.contains(&2) {
        PinUvAuthProtocol::Two
    } else {
        PinUvAuthProtocol::One
    }
}

/// A negotiated platform/authenticator shared secret plus the platform's
/// ephemeral key agreement key.
pub(crate) struct SharedSecret {
    protocol: PinUvAuthProtocol,
    // 32 bytes for protocol 1; protocol 2 concatenates the HMAC key and
    // the AES key.
    secret: Zeroizing<Vec<u8>>,
    platform_x: [u8; 32],
    platform_y: [u8; 32],
}

impl SharedSecret {
    pub fn protocol(&self) -> PinUvAuthProtocol {
        self.protocol
    }

    /// The platform key agreement key as a COSE_Key map.
    pub fn key_agreement_value(&self) -> Value {
        Value::Map(vec![
            (int(1), int(2)),   // kty: EC2
            (int(3), int(-7)),  // alg
            (int(-1), int(1)),  // crv: P-256
            (int(-2), Value::Bytes(self.platform_x.to_vec())),
            (int(-3), Value::Bytes(self.platform_y.to_vec())),
        ])
    }

    fn aes_key(&self) -> &[u8] {
        match self.protocol {
            PinUvAuthProtocol::One => &self.secret[..32],
            PinUvAuthProtocol::Two => &self.secret[32..64],
        }
    }

    fn hmac_key(&self) -> &[u8] {
        // Both protocols authenticate with the leading 32 bytes.
        &self.secret[..32]
    }

    /// AES-256-CBC without padding; the plaintext must be a multiple of
    /// 16 bytes. Protocol 2 prepends a fresh random IV.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match self.protocol {
            PinUvAuthProtocol::One => aes_cbc_encrypt(self.aes_key(), &[0u8; 16], plaintext),
            PinUvAuthProtocol::Two => {
                let mut iv = [0u8; 16];
                OsRng.fill_bytes(&mut iv);
                let mut out = iv.to_vec();
                out.extend_from_slice(&aes_cbc_encrypt(self.aes_key(), &iv, plaintext)?);
                Ok(out)
            }
        }
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        match self.protocol {
            PinUvAuthProtocol::One => aes_cbc_decrypt(self.aes_key(), &[0u8; 16], ciphertext),
            PinUvAuthProtocol::Two => {
                if ciphertext.len() < 16 {
                    return Err(Error::RxInvalidLen);
                }
                let (iv, body) = ciphertext.split_at(16);
                let mut iv_arr = [0u8; 16];
                iv_arr.copy_from_slice(iv);
                aes_cbc_decrypt(self.aes_key(), &iv_arr, body)
            }
        }
    }

    /// HMAC-SHA-256 over `message`: protocol 1 truncates to the first 16
    /// bytes, protocol 2 returns all 32.
    pub fn authenticate(&self, message: &[u8]) -> Vec<u8> {
        hmac_authenticate(self.protocol, self.hmac_key(), message)
    }

    #[cfg(test)]
    pub fn for_test(protocol: PinUvAuthProtocol, secret: Vec<u8>) -> Self {
        SharedSecret {
            protocol,
            secret: Zeroizing::new(secret),
            platform_x: [0u8; 32],
            platform_y: [0u8; 32],
        }
    }
}

fn aes_cbc_encrypt(key: &[u8], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() || data.len() % 16 != 0 {
        return Err(Error::InvalidArgument);
    }
    let cipher = Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| Error::Internal)?;
    let mut buf = data.to_vec();
    let len = buf.len();
    cipher
        .encrypt_padded_mut::<NoPadding>(&mut buf, len)
        .map_err(|_| Error::Internal)?;
    Ok(buf)
}

fn aes_cbc_decrypt(key: &[u8], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() || data.len() % 16 != 0 {
        return Err(Error::RxInvalidLen);
    }
    let cipher = Aes256CbcDec::new_from_slices(key, iv).map_err(|_| Error::Internal)?;
    let mut buf = data.to_vec();
    cipher
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|_| Error::Internal)?;
    Ok(buf)
}

/// The pinUvAuthParam primitive for an already-held key (shared secret
/// or token).
pub(crate) fn hmac_authenticate(
    protocol: PinUvAuthProtocol,
    key: &[u8],
    message: &[u8],
) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message);
    let digest = mac.finalize().into_bytes();
    match protocol {
        PinUvAuthProtocol::One => digest[..16].to_vec(),
        PinUvAuthProtocol::Two => digest.to_vec(),
    }
}

/// Extracts the x and y coordinates of a COSE EC2 key map.
pub(crate) fn parse_cose_ec2(map: &[(Value, Value)]) -> Result<([u8; 32], [u8; 32])> {
    let x = map_get(map, -2)
        .and_then(cbor_to_bytes)
        .ok_or(Error::RxInvalidCbor)?;
    let y = map_get(map, -3)
        .and_then(cbor_to_bytes)
        .ok_or(Error::RxInvalidCbor)?;
    if x.len() != 32 || y.len() != 32 {
        return Err(Error::RxInvalidCbor);
    }
    let mut xa = [0u8; 32];
    let mut ya = [0u8; 32];
    xa.copy_from_slice(&x);
    ya.copy_from_slice(&y);
    Ok((xa, ya))
}

/// Runs ECDH against the authenticator's key agreement key and derives
/// the session secret for `protocol`.
pub(crate) fn encapsulate(
    protocol: PinUvAuthProtocol,
    peer_key: &[(Value, Value)],
) -> Result<SharedSecret> {
    let (x, y) = parse_cose_ec2(peer_key)?;
    let point = EncodedPoint::from_affine_coordinates(
        GenericArray::from_slice(&x),
        GenericArray::from_slice(&y),
        false,
    );
    let peer: PublicKey =
        Option::from(PublicKey::from_encoded_point(&point)).ok_or(Error::RxInvalidCbor)?;

    let platform_secret = EphemeralSecret::random(&mut OsRng);
    let platform_public = PublicKey::from(&platform_secret);
    let encoded = platform_public.to_encoded_point(false);
    let mut platform_x = [0u8; 32];
    let mut platform_y = [0u8; 32];
    platform_x.copy_from_slice(&encoded.as_bytes()[1..33]);
    platform_y.copy_from_slice(&encoded.as_bytes()[33..65]);

    let z = platform_secret.diffie_hellman(&peer);
    let secret = match protocol {
        PinUvAuthProtocol::One => {
            let mut hasher = Sha256::new();
            hasher.update(z.raw_secret_bytes());
            Zeroizing::new(hasher.finalize().to_vec())
        }
        PinUvAuthProtocol::Two => {
            let hk = Hkdf::<Sha256>::new(Some(&[0u8; 32]), z.raw_secret_bytes());
            let mut hmac_key = [0u8; 32];
            let mut aes_key = [0u8; 32];
            hk.expand(b"CTAP2 HMAC key", &mut hmac_key)
                .map_err(|_| Error::Internal)?;
            hk.expand(b"CTAP2 AES key", &mut aes_key)
                .map_err(|_| Error::Internal)?;
            let mut secret = Vec::with_capacity(64);
            secret.extend_from_slice(&hmac_key);
            secret.extend_from_slice(&aes_key);
            Zeroizing::new(secret)
        }
    };

    Ok(SharedSecret {
        protocol,
        secret,
        platform_x,
        platform_y,
    })
}

/// Fetches the authenticator's key agreement key and completes ECDH.
pub(crate) fn negotiate(dev: &mut Session) -> Result<SharedSecret> {
    let protocol = select_protocol(dev);
    let request = Value::Map(vec![
        (int(1), int(protocol.number() as i64)),
        (int(2), int(PIN_GET_KEY_AGREEMENT as i64)),
    ]);
    let reply = dev
        .cbor_call(CTAP2_CLIENT_PIN, Some(&request))?
        .ok_or(Error::RxInvalidCbor)?;
    let map = match reply {
        Value::Map(m) => m,
        _ => return Err(Error::RxInvalidCbor),
    };
    let peer = match map_get(&map, 1) {
        Some(Value::Map(m)) => m.clone(),
        _ => return Err(Error::RxInvalidCbor),
    };
    encapsulate(protocol, &peer)
}

/// PIN retry information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinRetries {
    pub retries: u8,
    pub power_cycle_required: bool,
}

/// Get PIN retry counter
pub fn get_pin_retries(dev: &mut Session) -> Result<PinRetries> {
    log::debug!("Getting PIN retry counter...");
    let protocol = select_protocol(dev);
    let request = Value::Map(vec![
        (int(1), int(protocol.number() as i64)),
        (int(2), int(PIN_GET_RETRIES as i64)),
    ]);
    let reply = dev
        .cbor_call(CTAP2_CLIENT_PIN, Some(&request))?
        .ok_or(Error::RxInvalidCbor)?;
    let map = match reply {
        Value::Map(m) => m,
        _ => return Err(Error::RxInvalidCbor),
    };
    Ok(PinRetries {
        retries: map_get(&map, 3).and_then(cbor_to_u8).unwrap_or(0),
        power_cycle_required: map_get(&map, 4).and_then(cbor_to_bool).unwrap_or(false),
    })
}

/// Get user-verification retry counter
pub fn get_uv_retries(dev: &mut Session) -> Result<u8> {
    let protocol = select_protocol(dev);
    let request = Value::Map(vec![
        (int(1), int(protocol.number() as i64)),
        (int(2), int(PIN_GET_UV_RETRIES as i64)),
    ]);
    let reply = dev
        .cbor_call(CTAP2_CLIENT_PIN, Some(&request))?
        .ok_or(Error::RxInvalidCbor)?;
    let map = match reply {
        Value::Map(m) => m,
        _ => return Err(Error::RxInvalidCbor),
    };
    map_get(&map, 5).and_then(cbor_to_u8).ok_or(Error::RxInvalidCbor)
}

/// Minimum 4 Unicode code points, at most 63 bytes.
fn validate_pin(pin: &str) -> Result<()> {
    if pin.chars().count() < 4 || pin.len() > 63 {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

/// PINs travel zero-padded to 64 bytes.
fn pad_pin(pin: &str) -> Zeroizing<Vec<u8>> {
    let mut padded = Zeroizing::new(vec![0u8; 64]);
    padded[..pin.len()].copy_from_slice(pin.as_bytes());
    padded
}

fn pin_hash_left16(pin: &str) -> Zeroizing<Vec<u8>> {
    let mut hasher = Sha256::new();
    hasher.update(pin.as_bytes());
    Zeroizing::new(hasher.finalize()[..16].to_vec())
}

/// Set initial PIN
pub fn set_pin(dev: &mut Session, new_pin: &str) -> Result<()> {
    log::debug!("Setting PIN...");
    validate_pin(new_pin)?;

    let ss = negotiate(dev)?;
    let new_pin_enc = ss.encrypt(&pad_pin(new_pin))?;
    let param = ss.authenticate(&new_pin_enc);

    let request = Value::Map(vec![
        (int(1), int(ss.protocol().number() as i64)),
        (int(2), int(PIN_SET_PIN as i64)),
        (int(3), ss.key_agreement_value()),
        (int(4), Value::Bytes(param)),
        (int(5), Value::Bytes(new_pin_enc)),
    ]);
    dev.cbor_call(CTAP2_CLIENT_PIN, Some(&request))?;
    dev.clear_token();
    log::info!("PIN set successfully");
    Ok(())
}

/// Change existing PIN
pub fn change_pin(dev: &mut Session, current_pin: &str, new_pin: &str) -> Result<()> {
    log::debug!("Changing PIN...");
    validate_pin(current_pin)?;
    validate_pin(new_pin)?;

    let ss = negotiate(dev)?;
    let new_pin_enc = ss.encrypt(&pad_pin(new_pin))?;
    let pin_hash_enc = ss.encrypt(&pin_hash_left16(current_pin))?;

    let mut message = new_pin_enc.clone();
    message.extend_from_slice(&pin_hash_enc);
    let param = ss.authenticate(&message);

    let request = Value::Map(vec![
        (int(1), int(ss.protocol().number() as i64)),
        (int(2), int(PIN_CHANGE_PIN as i64)),
        (int(3), ss.key_agreement_value()),
        (int(4), Value::Bytes(param)),
        (int(5), Value::Bytes(new_pin_enc)),
        (int(6), Value::Bytes(pin_hash_enc)),
    ]);
    dev.cbor_call(CTAP2_CLIENT_PIN, Some(&request))?;
    dev.clear_token();
    log::info!("PIN changed successfully");
    Ok(())
}

fn decrypt_token(ss: &SharedSecret, reply: Option<Value>) -> Result<Zeroizing<Vec<u8>>> {
    let map = match reply {
        Some(Value::Map(m)) => m,
        _ => return Err(Error::RxInvalidCbor),
    };
    let encrypted = map_get(&map, 2)
        .and_then(cbor_to_bytes)
        .ok_or(Error::RxInvalidCbor)?;
    let token = Zeroizing::new(ss.decrypt(&encrypted)?);
    let valid_len = match ss.protocol() {
        PinUvAuthProtocol::One => token.len() == 16 || token.len() == 32,
        PinUvAuthProtocol::Two => token.len() == 32,
    };
    if !valid_len {
        return Err(Error::RxInvalidLen);
    }
    Ok(token)
}

fn cache_token(dev: &mut Session, protocol: PinUvAuthProtocol, token: Zeroizing<Vec<u8>>) {
    dev.token = Some(token);
    dev.token_protocol = Some(protocol);
}

/// Legacy getPinToken (protocol 1 only, no permissions).
pub fn get_pin_token(dev: &mut Session, pin: &str) -> Result<()> {
    validate_pin(pin)?;
    let ss = encapsulate_v1(dev)?;
    let pin_hash_enc = ss.encrypt(&pin_hash_left16(pin))?;

    let request = Value::Map(vec![
        (int(1), int(1)),
        (int(2), int(PIN_GET_PIN_TOKEN as i64)),
        (int(3), ss.key_agreement_value()),
        (int(6), Value::Bytes(pin_hash_enc)),
    ]);
    let reply = dev.cbor_call(CTAP2_CLIENT_PIN, Some(&request))?;
    let token = decrypt_token(&ss, reply)?;
    cache_token(dev, PinUvAuthProtocol::One, token);
    Ok(())
}

fn encapsulate_v1(dev: &mut Session) -> Result<SharedSecret> {
    let request = Value::Map(vec![
        (int(1), int(1)),
        (int(2), int(PIN_GET_KEY_AGREEMENT as i64)),
    ]);
    let reply = dev
        .cbor_call(CTAP2_CLIENT_PIN, Some(&request))?
        .ok_or(Error::RxInvalidCbor)?;
    let map = match reply {
        Value::Map(m) => m,
        _ => return Err(Error::RxInvalidCbor),
    };
    let peer = match map_get(&map, 1) {
        Some(Value::Map(m)) => m.clone(),
        _ => return Err(Error::RxInvalidCbor),
    };
    encapsulate(PinUvAuthProtocol::One, &peer)
}

/// Acquires a pinUvAuthToken with `permissions` using the PIN, caching
/// it on the session.
pub fn get_token_with_pin(
    dev: &mut Session,
    pin: &str,
    permissions: u8,
    rp_id: Option<&str>,
) -> Result<()> {
    validate_pin(pin)?;
    let ss = negotiate(dev)?;
    let pin_hash_enc = ss.encrypt(&pin_hash_left16(pin))?;

    let mut entries = vec![
        (int(1), int(ss.protocol().number() as i64)),
        (
            int(2),
            int(PIN_GET_PIN_UV_AUTH_TOKEN_USING_PIN_WITH_PERMISSIONS as i64),
        ),
        (int(3), ss.key_agreement_value()),
        (int(6), Value::Bytes(pin_hash_enc)),
        (int(9), int(permissions as i64)),
    ];
    if let Some(rp_id) = rp_id {
        entries.push((int(0x0A), Value::Text(rp_id.to_string())));
    }

    let reply = dev.cbor_call(CTAP2_CLIENT_PIN, Some(&Value::Map(entries)))?;
    let token = decrypt_token(&ss, reply)?;
    cache_token(dev, ss.protocol(), token);
    Ok(())
}

/// Acquires a pinUvAuthToken with `permissions` using built-in user
/// verification, caching it on the session.
pub fn get_token_with_uv(dev: &mut Session, permissions: u8, rp_id: Option<&str>) -> Result<()> {
    let ss = negotiate(dev)?;

    let mut entries = vec![
        (int(1), int(ss.protocol().number() as i64)),
        (
            int(2),
            int(PIN_GET_PIN_UV_AUTH_TOKEN_USING_UV_WITH_PERMISSIONS as i64),
        ),
        (int(3), ss.key_agreement_value()),
        (int(9), int(permissions as i64)),
    ];
    if let Some(rp_id) = rp_id {
        entries.push((int(0x0A), Value::Text(rp_id.to_string())));
    }

    let reply = dev.cbor_call(CTAP2_CLIENT_PIN, Some(&Value::Map(entries)))?;
    let token = decrypt_token(&ss, reply)?;
    cache_token(dev, ss.protocol(), token);
    Ok(())
}

/// Makes sure the session holds a token usable for `permissions`,
/// acquiring one if needed. A cached token is reused as-is; its lifetime
/// already spans the session.
pub(crate) fn ensure_token(
    dev: &mut Session,
    permissions: u8,
    rp_id: Option<&str>,
    pin: Option<&str>,
) -> Result<()> {
    if dev.token.is_some() {
        return Ok(());
    }
    let permission_tokens = dev
        .info()
        .and_then(|i| i.option("pinUvAuthToken"))
        .unwrap_or(false);
    match pin {
        Some(pin) if permission_tokens => get_token_with_pin(dev, pin, permissions, rp_id),
        Some(pin) => get_pin_token(dev, pin),
        None if dev.info().and_then(|i| i.option("uv")).unwrap_or(false) => {
            get_token_with_uv(dev, permissions, rp_id)
        }
        None => Err(Error::PinRequired),
    }
}

/// pinUvAuthParam over `message` with the session's cached token.
pub(crate) fn authenticate_with_token(dev: &Session, message: &[u8]) -> Result<(u8, Vec<u8>)> {
    let token = dev.token.as_ref().ok_or(Error::InvalidState)?;
    let protocol = dev.token_protocol.ok_or(Error::InvalidState)?;
    Ok((
        protocol.number(),
        hmac_authenticate(protocol, token, message),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error;
    use crate::testutil::{open_session, TEST_CID};

    fn test_authenticator_key() -> (EphemeralSecret, Value) {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public = PublicKey::from(&secret);
        let encoded = public.to_encoded_point(false);
        let cose = Value::Map(vec![
            (int(1), int(2)),
            (int(3), int(-7)),
            (int(-1), int(1)),
            (int(-2), Value::Bytes(encoded.as_bytes()[1..33].to_vec())),
            (int(-3), Value::Bytes(encoded.as_bytes()[33..65].to_vec())),
        ]);
        (secret, cose)
    }

    fn derive_v2(z: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let hk = Hkdf::<Sha256>::new(Some(&[0u8; 32]), z);
        let mut hmac_key = vec![0u8; 32];
        let mut aes_key = vec![0u8; 32];
        hk.expand(b"CTAP2 HMAC key", &mut hmac_key).unwrap();
        hk.expand(b"CTAP2 AES key", &mut aes_key).unwrap();
        (hmac_key, aes_key)
    }

    #[test]
    fn test_authenticate_lengths_and_determinism() {
        let ss1 = SharedSecret::for_test(PinUvAuthProtocol::One, vec![0x11; 32]);
        let ss2 = SharedSecret::for_test(PinUvAuthProtocol::Two, vec![0x22; 64]);
        let msg = b"message";
        assert_eq!(ss1.authenticate(msg).len(), 16);
        assert_eq!(ss2.authenticate(msg).len(), 32);
        assert_eq!(ss1.authenticate(msg), ss1.authenticate(msg));
        assert_eq!(ss2.authenticate(msg), ss2.authenticate(msg));
    }

    #[test]
    fn test_protocol1_encrypt_round_trip() {
        let ss = SharedSecret::for_test(PinUvAuthProtocol::One, vec![0x33; 32]);
        let plaintext = [0x44u8; 64];
        let ciphertext = ss.encrypt(&plaintext).unwrap();
        assert_eq!(ciphertext.len(), 64);
        assert_eq!(ss.decrypt(&ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn test_protocol2_encrypt_prepends_iv() {
        let ss = SharedSecret::for_test(PinUvAuthProtocol::Two, vec![0x55; 64]);
        let plaintext = [0x66u8; 64];
        let a = ss.encrypt(&plaintext).unwrap();
        let b = ss.encrypt(&plaintext).unwrap();
        assert_eq!(a.len(), 80);
        assert_ne!(a, b);
        assert_eq!(ss.decrypt(&a).unwrap(), plaintext);
        assert_eq!(ss.decrypt(&b).unwrap(), plaintext);
    }

    #[test]
    fn test_pin_validation() {
        assert_eq!(validate_pin("123"), Err(Error::InvalidArgument));
        assert!(validate_pin("1234").is_ok());
        // Four code points, more than four bytes.
        assert!(validate_pin("ąбčد").is_ok());
        assert!(validate_pin(&"a".repeat(63)).is_ok());
        assert_eq!(validate_pin(&"a".repeat(64)), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_change_pin_protocol2_wire_format() {
        let (auth_secret, auth_cose) = test_authenticator_key();
        let (mut dev, transport) = open_session();
        transport.push_cbor_reply(
            TEST_CID,
            0,
            Some(&Value::Map(vec![(int(1), auth_cose)])),
        );
        transport.push_cbor_reply(TEST_CID, 0, None);

        change_pin(&mut dev, "1234", "abcdef").unwrap();

        let requests = transport.sent_cbor_requests();
        // getInfo, getKeyAgreement, changePIN
        let (cmd, body) = &requests[2];
        assert_eq!(*cmd, CTAP2_CLIENT_PIN);
        let (value, _) = cbor::decode(body).unwrap();
        let map = match value {
            Value::Map(m) => m,
            _ => panic!("expected map"),
        };
        assert_eq!(map_get(&map, 2).and_then(cbor_to_u8), Some(PIN_CHANGE_PIN));

        let param = map_get(&map, 4).and_then(cbor_to_bytes).unwrap();
        let new_pin_enc = map_get(&map, 5).and_then(cbor_to_bytes).unwrap();
        let pin_hash_enc = map_get(&map, 6).and_then(cbor_to_bytes).unwrap();
        assert_eq!(new_pin_enc.len(), 80); // 16-byte IV + 64 padded bytes
        assert_eq!(pin_hash_enc.len(), 32); // 16-byte IV + 16-byte hash
        assert_eq!(param.len(), 32);

        // Replay the authenticator side of the ECDH to check the
        // ciphertexts and the MAC.
        let platform_key = match map_get(&map, 3) {
            Some(Value::Map(m)) => m.clone(),
            _ => panic!("missing key agreement"),
        };
        let (x, y) = parse_cose_ec2(&platform_key).unwrap();
        let point = EncodedPoint::from_affine_coordinates(
            GenericArray::from_slice(&x),
            GenericArray::from_slice(&y),
            false,
        );
        let platform_pub: PublicKey =
            Option::from(PublicKey::from_encoded_point(&point)).unwrap();
        let z = auth_secret.diffie_hellman(&platform_pub);
        let (hmac_key, aes_key) = derive_v2(z.raw_secret_bytes());

        let decrypted_hash =
            aes_cbc_decrypt(&aes_key, pin_hash_enc[..16].try_into().unwrap(), &pin_hash_enc[16..])
                .unwrap();
        let mut hasher = Sha256::new();
        hasher.update(b"1234");
        assert_eq!(decrypted_hash, hasher.finalize()[..16].to_vec());

        let decrypted_pin =
            aes_cbc_decrypt(&aes_key, new_pin_enc[..16].try_into().unwrap(), &new_pin_enc[16..])
                .unwrap();
        assert_eq!(&decrypted_pin[..6], b"abcdef");
        assert!(decrypted_pin[6..].iter().all(|&b| b == 0));

        let mut message = new_pin_enc.clone();
        message.extend_from_slice(&pin_hash_enc);
        assert_eq!(
            param,
            hmac_authenticate(PinUvAuthProtocol::Two, &hmac_key, &message)
        );
    }

    #[test]
    fn test_set_pin_invalidates_cached_token() {
        let (_, auth_cose) = test_authenticator_key();
        let (mut dev, transport) = open_session();
        dev.token = Some(Zeroizing::new(vec![0x5A; 32]));
        dev.token_protocol = Some(PinUvAuthProtocol::Two);

        transport.push_cbor_reply(
            TEST_CID,
            0,
            Some(&Value::Map(vec![(int(1), auth_cose)])),
        );
        transport.push_cbor_reply(TEST_CID, 0, None);
        set_pin(&mut dev, "9876").unwrap();
        assert!(dev.token.is_none());
    }

    #[test]
    fn test_get_token_with_pin_caches_token() {
        let (_, auth_cose) = test_authenticator_key();
        let (mut dev, transport) = open_session();
        transport.push_cbor_reply(
            TEST_CID,
            0,
            Some(&Value::Map(vec![(int(1), auth_cose)])),
        );
        // 48 ciphertext bytes decrypt to a 32-byte token under protocol 2.
        transport.push_cbor_reply(
            TEST_CID,
            0,
            Some(&Value::Map(vec![(int(2), Value::Bytes(vec![0u8; 48]))])),
        );

        get_token_with_pin(&mut dev, "1234", permissions::GET_ASSERTION, Some("example.com"))
            .unwrap();
        assert_eq!(dev.token.as_ref().unwrap().len(), 32);
        assert_eq!(dev.token_protocol, Some(PinUvAuthProtocol::Two));

        // The request carried the permission bits and the rpId binding.
        let requests = transport.sent_cbor_requests();
        let (_, body) = &requests[2];
        let (value, _) = cbor::decode(body).unwrap();
        let map = match value {
            Value::Map(m) => m,
            _ => panic!("expected map"),
        };
        assert_eq!(
            map_get(&map, 9).and_then(cbor_to_u8),
            Some(permissions::GET_ASSERTION)
        );
        assert_eq!(
            map_get(&map, 0x0A).map(cbor::cbor_to_string),
            Some("example.com".to_string())
        );
    }

    #[test]
    fn test_get_pin_retries() {
        let (mut dev, transport) = open_session();
        transport.push_cbor_reply(
            TEST_CID,
            0,
            Some(&Value::Map(vec![
                (int(3), int(7)),
                (int(4), Value::Bool(true)),
            ])),
        );
        let retries = get_pin_retries(&mut dev).unwrap();
        assert_eq!(retries.retries, 7);
        assert!(retries.power_cycle_required);
    }

    #[test]
    fn test_pin_blocked_surfaces() {
        let (mut dev, transport) = open_session();
        transport.push_cbor_reply(TEST_CID, error::CTAP2_ERR_PIN_BLOCKED, None);
        assert_eq!(
            get_pin_retries(&mut dev).unwrap_err(),
            Error::PinBlocked
        );
    }
}
