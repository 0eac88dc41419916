//! Legacy CTAP1/U2F fallback, used when a session has no CBOR
//! capability (or the caller forced it off). Register and sign travel
//! as extended-length APDUs over CTAPHID MSG frames; replies are
//! re-shaped into the same structures the CTAP2 workflows return.

use std::time::{Duration, Instant};

use crate::assertion::{Assertion, GetAssertionArgs};
use crate::cbor::{self, int, Value};
use crate::cred::{
    parse_auth_data, sha256, Attestation, AttestationStatement, MakeCredentialArgs, FLAG_AT,
    FLAG_UP,
};
use crate::error::{Error, Result};
use crate::session::Session;

const U2F_REGISTER: u8 = 0x01;
const U2F_AUTHENTICATE: u8 = 0x02;

/// Authenticate control bytes.
const P1_ENFORCE_UP_AND_SIGN: u8 = 0x03;
const P1_CHECK_ONLY: u8 = 0x07;

const SW_NO_ERROR: u16 = 0x9000;
const SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
const SW_WRONG_DATA: u16 = 0x6A80;

/// Poll interval while waiting for the user to touch the key.
const UP_POLL_MS: u64 = 100;

fn apdu(ins: u8, p1: u8, data: &[u8]) -> Vec<u8> {
    let mut out = vec![0x00, ins, p1, 0x00, 0x00];
    out.push((data.len() >> 8) as u8);
    out.push(data.len() as u8);
    out.extend_from_slice(data);
    out.extend_from_slice(&[0x00, 0x00]);
    out
}

fn status_word(reply: &[u8]) -> Result<u16> {
    if reply.len() < 2 {
        return Err(Error::RxInvalidLen);
    }
    Ok(((reply[reply.len() - 2] as u16) << 8) | reply[reply.len() - 1] as u16)
}

/// Sends an APDU, retrying on conditions-not-satisfied until the user
/// touches the key or the session timeout runs out.
fn transact_up(dev: &mut Session, request: &[u8]) -> Result<Vec<u8>> {
    let deadline = match dev.timeout_ms() {
        t if t < 0 => None,
        t => Some(Instant::now() + Duration::from_millis(t as u64)),
    };
    loop {
        let reply = dev.msg_call(request)?;
        match status_word(&reply)? {
            SW_NO_ERROR => return Ok(reply[..reply.len() - 2].to_vec()),
            SW_CONDITIONS_NOT_SATISFIED => {
                if let Some(at) = deadline {
                    if Instant::now() >= at {
                        return Err(Error::ActionTimeout);
                    }
                }
                log::debug!("Waiting for user presence...");
                std::thread::sleep(Duration::from_millis(UP_POLL_MS));
            }
            SW_WRONG_DATA => return Err(Error::NoCredentials),
            sw => return Err(Error::Rx(format!("U2F status word 0x{:04x}", sw))),
        }
    }
}

/// Key-handle probe: a check-only authenticate that reports
/// conditions-not-satisfied for a handle the key recognises.
fn key_handle_matches(dev: &mut Session, data: &[u8]) -> Result<bool> {
    let reply = dev.msg_call(&apdu(U2F_AUTHENTICATE, P1_CHECK_ONLY, data))?;
    match status_word(&reply)? {
        SW_CONDITIONS_NOT_SATISFIED | SW_NO_ERROR => Ok(true),
        SW_WRONG_DATA => Ok(false),
        sw => Err(Error::Rx(format!("U2F status word 0x{:04x}", sw))),
    }
}

/// Certificate length from its DER header, so the trailing signature can
/// be split off the register reply.
fn der_length(cert: &[u8]) -> Result<usize> {
    if cert.len() < 2 || cert[0] != 0x30 {
        return Err(Error::RxInvalidCbor);
    }
    if cert[1] & 0x80 == 0 {
        return Ok(2 + cert[1] as usize);
    }
    let n = (cert[1] & 0x7F) as usize;
    if n == 0 || n > 2 || cert.len() < 2 + n {
        return Err(Error::RxInvalidCbor);
    }
    let mut len = 0usize;
    for &b in &cert[2..2 + n] {
        len = (len << 8) | b as usize;
    }
    Ok(2 + n + len)
}

/// U2F register, surfaced as a fido-u2f attestation.
pub(crate) fn register(dev: &mut Session, args: &MakeCredentialArgs) -> Result<Attestation> {
    if args.resident_key || args.user_verification || args.pin.is_some() {
        return Err(Error::UnsupportedOption);
    }
    if !args.algorithms.contains(&-7) {
        return Err(Error::UnsupportedAlgorithm);
    }

    let app_param = sha256(args.rp.id.as_bytes());
    let mut challenge = args.client_data_hash.to_vec();
    challenge.extend_from_slice(&app_param);

    for descriptor in &args.exclude_list {
        let mut probe = challenge.clone();
        probe.push(descriptor.id.len() as u8);
        probe.extend_from_slice(&descriptor.id);
        if key_handle_matches(dev, &probe)? {
            return Err(Error::CredExcluded);
        }
    }

    let reply = transact_up(dev, &apdu(U2F_REGISTER, 0x00, &challenge))?;
    // Reply: 0x05 || pubkey(65) || khLen || kh || x509 || signature.
    if reply.len() < 67 || reply[0] != 0x05 || reply[1] != 0x04 {
        return Err(Error::RxInvalidLen);
    }
    let public_key = &reply[1..66];
    let kh_len = reply[66] as usize;
    if reply.len() < 67 + kh_len {
        return Err(Error::RxInvalidLen);
    }
    let key_handle = &reply[67..67 + kh_len];
    let rest = &reply[67 + kh_len..];
    let cert_len = der_length(rest)?;
    if rest.len() < cert_len {
        return Err(Error::RxInvalidLen);
    }
    let (cert, signature) = rest.split_at(cert_len);

    // Re-shape into webauthn authenticator data with a zero AAGUID.
    let cose_key = Value::Map(vec![
        (int(1), int(2)),
        (int(3), int(-7)),
        (int(-1), int(1)),
        (int(-2), Value::Bytes(public_key[1..33].to_vec())),
        (int(-3), Value::Bytes(public_key[33..65].to_vec())),
    ]);
    let mut raw_auth_data = Vec::new();
    raw_auth_data.extend_from_slice(&app_param);
    raw_auth_data.push(FLAG_UP | FLAG_AT);
    raw_auth_data.extend_from_slice(&0u32.to_be_bytes());
    raw_auth_data.extend_from_slice(&[0u8; 16]);
    raw_auth_data.extend_from_slice(&(kh_len as u16).to_be_bytes());
    raw_auth_data.extend_from_slice(key_handle);
    raw_auth_data.extend_from_slice(&cbor::encode(&cose_key)?);

    Ok(Attestation {
        format: "fido-u2f".to_string(),
        auth_data: parse_auth_data(&raw_auth_data)?,
        raw_auth_data,
        statement: AttestationStatement {
            sig: Some(signature.to_vec()),
            x5c: vec![cert.to_vec()],
            ..AttestationStatement::default()
        },
        enterprise: false,
        large_blob_key: None,
    })
}

/// U2F sign over the first allow-list credential the key recognises.
pub(crate) fn sign(dev: &mut Session, args: &GetAssertionArgs) -> Result<Vec<Assertion>> {
    if args.user_verification || args.pin.is_some() {
        return Err(Error::UnsupportedOption);
    }
    if args.allow_list.is_empty() {
        // Discoverable credentials do not exist in U2F.
        return Err(Error::NoCredentials);
    }

    let app_param = sha256(args.rp_id.as_bytes());
    let mut base = args.client_data_hash.to_vec();
    base.extend_from_slice(&app_param);

    for descriptor in &args.allow_list {
        let mut data = base.clone();
        data.push(descriptor.id.len() as u8);
        data.extend_from_slice(&descriptor.id);
        if !key_handle_matches(dev, &data)? {
            continue;
        }

        let reply = transact_up(dev, &apdu(U2F_AUTHENTICATE, P1_ENFORCE_UP_AND_SIGN, &data))?;
        // Reply: presence || counter(4, big endian) || signature.
        if reply.len() < 6 {
            return Err(Error::RxInvalidLen);
        }
        let mut raw_auth_data = Vec::new();
        raw_auth_data.extend_from_slice(&app_param);
        raw_auth_data.push(reply[0] & FLAG_UP);
        raw_auth_data.extend_from_slice(&reply[1..5]);

        return Ok(vec![Assertion {
            credential_id: descriptor.id.clone(),
            auth_data: parse_auth_data(&raw_auth_data)?,
            raw_auth_data,
            signature: reply[5..].to_vec(),
            user: None,
            user_selected: None,
            large_blob_key: None,
            hmac_secret: None,
        }]);
    }

    Err(Error::NoCredentials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cred::{CredentialDescriptor, RelyingParty, User};
    use crate::hid;
    use crate::testutil::{open_session, TEST_CID};

    fn push_msg_reply(transport: &crate::testutil::ScriptedTransport, payload: &[u8]) {
        transport.push_message(TEST_CID, hid::CMD_MSG, payload);
    }

    fn register_args() -> MakeCredentialArgs {
        MakeCredentialArgs {
            rp: RelyingParty {
                id: "example.com".into(),
                name: None,
            },
            user: User {
                id: vec![1],
                ..User::default()
            },
            client_data_hash: [0x77; 32],
            algorithms: vec![-7],
            exclude_list: Vec::new(),
            extensions: Default::default(),
            resident_key: false,
            user_verification: false,
            pin: None,
            enterprise_attestation: None,
        }
    }

    fn register_reply(kh: &[u8]) -> Vec<u8> {
        let mut reply = vec![0x05, 0x04];
        reply.extend_from_slice(&[0x11; 32]); // x
        reply.extend_from_slice(&[0x22; 32]); // y
        reply.push(kh.len() as u8);
        reply.extend_from_slice(kh);
        reply.extend_from_slice(&[0x30, 0x03, 0xAA, 0xBB, 0xCC]); // stub DER cert
        reply.extend_from_slice(&[0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x01]);
        reply.extend_from_slice(&SW_NO_ERROR.to_be_bytes());
        reply
    }

    #[test]
    fn test_register_reshapes_to_fido_u2f() {
        let (mut dev, transport) = open_session();
        dev.force_u2f();
        push_msg_reply(&transport, &register_reply(&[0xC1; 8]));

        let attestation = crate::cred::make_credential(&mut dev, &register_args()).unwrap();
        assert_eq!(attestation.format, "fido-u2f");
        assert_eq!(attestation.statement.x5c.len(), 1);
        assert_eq!(
            attestation.statement.sig.as_deref(),
            Some(&[0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x01][..])
        );
        assert_eq!(
            attestation.auth_data.rp_id_hash,
            sha256(b"example.com")
        );
        assert!(attestation.auth_data.user_present());
        let attested = attestation.auth_data.attested_credential.unwrap();
        assert_eq!(attested.credential_id, vec![0xC1; 8]);
        assert_eq!(attested.aaguid, [0u8; 16]);

        // The register APDU carried challenge || application.
        let messages = transport.sent_messages();
        let (cmd, request) = messages.last().unwrap();
        assert_eq!(*cmd, hid::CMD_MSG);
        assert_eq!(request[1], U2F_REGISTER);
        assert_eq!(&request[7..39], &[0x77; 32]);
        assert_eq!(&request[39..71], &sha256(b"example.com"));
    }

    #[test]
    fn test_register_retries_on_missing_touch() {
        let (mut dev, transport) = open_session();
        dev.force_u2f();
        push_msg_reply(&transport, &SW_CONDITIONS_NOT_SATISFIED.to_be_bytes());
        push_msg_reply(&transport, &register_reply(&[0xC1; 8]));

        let attestation = crate::cred::make_credential(&mut dev, &register_args()).unwrap();
        assert_eq!(attestation.format, "fido-u2f");
        // INIT handshake, getInfo, then two register attempts.
        assert_eq!(transport.sent_messages().len(), 4);
    }

    #[test]
    fn test_register_rejects_excluded_handle() {
        let (mut dev, transport) = open_session();
        dev.force_u2f();
        // Check-only probe answers conditions-not-satisfied: handle known.
        push_msg_reply(&transport, &SW_CONDITIONS_NOT_SATISFIED.to_be_bytes());

        let mut args = register_args();
        args.exclude_list.push(CredentialDescriptor {
            id: vec![0xC1; 8],
            public_key: None,
        });
        assert_eq!(
            crate::cred::make_credential(&mut dev, &args),
            Err(Error::CredExcluded)
        );
    }

    #[test]
    fn test_sign_selects_matching_handle() {
        let (mut dev, transport) = open_session();
        dev.force_u2f();
        // First handle unknown, second known, then the signature reply.
        push_msg_reply(&transport, &SW_WRONG_DATA.to_be_bytes());
        push_msg_reply(&transport, &SW_CONDITIONS_NOT_SATISFIED.to_be_bytes());
        let mut sign_reply = vec![0x01];
        sign_reply.extend_from_slice(&9u32.to_be_bytes());
        sign_reply.extend_from_slice(&[0x30, 0x06, 0x02, 0x01, 0x02, 0x02, 0x01, 0x02]);
        sign_reply.extend_from_slice(&SW_NO_ERROR.to_be_bytes());
        push_msg_reply(&transport, &sign_reply);

        let args = GetAssertionArgs {
            rp_id: "example.com".into(),
            client_data_hash: [0x99; 32],
            allow_list: vec![
                CredentialDescriptor {
                    id: vec![0xAA; 8],
                    public_key: None,
                },
                CredentialDescriptor {
                    id: vec![0xBB; 8],
                    public_key: None,
                },
            ],
            ..GetAssertionArgs::default()
        };
        let assertions = crate::assertion::get_assertion(&mut dev, &args).unwrap();
        assert_eq!(assertions.len(), 1);
        assert_eq!(assertions[0].credential_id, vec![0xBB; 8]);
        assert_eq!(assertions[0].auth_data.sign_count, 9);
        assert!(assertions[0].auth_data.user_present());
    }

    #[test]
    fn test_sign_without_allow_list() {
        let (mut dev, _transport) = open_session();
        dev.force_u2f();
        let args = GetAssertionArgs {
            rp_id: "example.com".into(),
            ..GetAssertionArgs::default()
        };
        assert_eq!(
            crate::assertion::get_assertion(&mut dev, &args),
            Err(Error::NoCredentials)
        );
    }

    #[test]
    fn test_der_length_forms() {
        assert_eq!(der_length(&[0x30, 0x03, 1, 2, 3]).unwrap(), 5);
        let mut long = vec![0x30, 0x82, 0x01, 0x00];
        long.extend_from_slice(&vec![0u8; 0x100]);
        assert_eq!(der_length(&long).unwrap(), 0x104);
        assert!(der_length(&[0x31, 0x00]).is_err());
    }
}
