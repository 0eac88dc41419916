//! Credential management: resident-credential metadata, paginated
//! enumeration of relying parties and their credentials, deletion, and
//! user-information updates.
//!
//! Every begin/delete/update call is authenticated with a
//! pinUvAuthParam over `subCommand || subCommandParams`; the follow-up
//! getNext calls are not.

use serde::{Deserialize, Serialize};

use crate::cbor::{self, cbor_to_bytes, cbor_to_string, cbor_to_u32, cbor_to_u8, int, map_get, map_get_text, Value};
use crate::cred::{parse_user, user_value, CredentialDescriptor, RelyingParty, User};
use crate::error::{Error, Result};
use crate::pin::{self, permissions};
use crate::session::{Session, CTAP2_CREDENTIAL_MANAGEMENT, CTAP2_CREDENTIAL_MANAGEMENT_PRE};

/// Credential management subcommands
const CM_GET_CREDS_METADATA: u8 = 0x01;
const CM_ENUMERATE_RPS_BEGIN: u8 = 0x02;
const CM_ENUMERATE_RPS_NEXT: u8 = 0x03;
const CM_ENUMERATE_CREDENTIALS_BEGIN: u8 = 0x04;
const CM_ENUMERATE_CREDENTIALS_NEXT: u8 = 0x05;
const CM_DELETE_CREDENTIAL: u8 = 0x06;
const CM_UPDATE_USER_INFORMATION: u8 = 0x07;

/// Resident credential usage counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredsMetadata {
    pub existing: u32,
    pub remaining: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelyingPartyEntry {
    pub rp: RelyingParty,
    pub rp_id_hash: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedCredential {
    pub user: User,
    pub credential_id: Vec<u8>,
    pub public_key: Vec<(Value, Value)>,
    pub cred_protect: Option<u8>,
    pub large_blob_key: Option<Vec<u8>>,
}

fn command_byte(dev: &Session) -> u8 {
    match dev.info() {
        Some(info) if info.prototype_only() => CTAP2_CREDENTIAL_MANAGEMENT_PRE,
        _ => CTAP2_CREDENTIAL_MANAGEMENT,
    }
}

/// One credential-management exchange. `authenticate` adds the
/// pinUvAuthParam over `subCommand || subCommandParams`.
fn call(
    dev: &mut Session,
    sub_command: u8,
    params: Option<Value>,
    authenticate: bool,
) -> Result<Option<Vec<(Value, Value)>>> {
    let cmd = command_byte(dev);
    let mut entries = vec![(int(1), int(sub_command as i64))];
    if let Some(params) = &params {
        entries.push((int(2), params.clone()));
    }

    if authenticate {
        let mut message = vec![sub_command];
        if let Some(params) = &params {
            message.extend_from_slice(&cbor::encode(params)?);
        }
        let (protocol, param) = pin::authenticate_with_token(dev, &message)?;
        entries.push((int(3), int(protocol as i64)));
        entries.push((int(4), Value::Bytes(param)));
    }

    match dev.cbor_call(cmd, Some(&Value::Map(entries)))? {
        Some(Value::Map(map)) => Ok(Some(map)),
        Some(_) => Err(Error::RxInvalidCbor),
        None => Ok(None),
    }
}

fn token_for_management(dev: &mut Session, pin: Option<&str>) -> Result<()> {
    pin::ensure_token(dev, permissions::CREDENTIAL_MANAGEMENT, None, pin)
}

/// How many resident credentials exist and how many more fit.
pub fn get_creds_metadata(dev: &mut Session, pin: Option<&str>) -> Result<CredsMetadata> {
    token_for_management(dev, pin)?;
    let map = call(dev, CM_GET_CREDS_METADATA, None, true)?.ok_or(Error::RxInvalidCbor)?;
    Ok(CredsMetadata {
        existing: map_get(&map, 1).and_then(cbor_to_u32).ok_or(Error::RxInvalidCbor)?,
        remaining: map_get(&map, 2).and_then(cbor_to_u32).ok_or(Error::RxInvalidCbor)?,
    })
}

fn parse_rp_entry(map: &[(Value, Value)]) -> Result<RelyingPartyEntry> {
    let rp = match map_get(map, 3) {
        Some(Value::Map(rp_map)) => RelyingParty {
            id: map_get_text(rp_map, "id").map(cbor_to_string).unwrap_or_default(),
            name: map_get_text(rp_map, "name").map(cbor_to_string),
        },
        _ => return Err(Error::RxInvalidCbor),
    };
    let rp_id_hash = map_get(map, 4).and_then(cbor_to_bytes).ok_or(Error::RxInvalidCbor)?;
    Ok(RelyingPartyEntry { rp, rp_id_hash })
}

/// Enumerates every relying party with resident credentials.
pub fn enumerate_rps(dev: &mut Session, pin: Option<&str>) -> Result<Vec<RelyingPartyEntry>> {
    token_for_management(dev, pin)?;
    let first = match call(dev, CM_ENUMERATE_RPS_BEGIN, None, true) {
        Ok(map) => map.ok_or(Error::RxInvalidCbor)?,
        // An authenticator without resident credentials reports none.
        Err(Error::NoCredentials) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let total = map_get(&first, 5).and_then(cbor_to_u32).unwrap_or(1);
    let mut entries = vec![parse_rp_entry(&first)?];
    for _ in 1..total {
        let map = call(dev, CM_ENUMERATE_RPS_NEXT, None, false)?.ok_or(Error::RxInvalidCbor)?;
        entries.push(parse_rp_entry(&map)?);
    }
    log::debug!("Enumerated {} relying parties", entries.len());
    Ok(entries)
}

fn parse_credential_entry(map: &[(Value, Value)]) -> Result<ManagedCredential> {
    let user = match map_get(map, 6) {
        Some(Value::Map(user_map)) => parse_user(user_map),
        _ => return Err(Error::RxInvalidCbor),
    };
    let credential_id = match map_get(map, 7) {
        Some(Value::Map(descriptor)) => map_get_text(descriptor, "id")
            .and_then(cbor_to_bytes)
            .ok_or(Error::RxInvalidCbor)?,
        _ => return Err(Error::RxInvalidCbor),
    };
    let public_key = match map_get(map, 8) {
        Some(Value::Map(key)) => key.clone(),
        _ => Vec::new(),
    };
    Ok(ManagedCredential {
        user,
        credential_id,
        public_key,
        cred_protect: map_get(map, 0x0A).and_then(cbor_to_u8),
        large_blob_key: map_get(map, 0x0B).and_then(cbor_to_bytes),
    })
}

/// Enumerates the resident credentials scoped to one relying-party id
/// hash (as reported by [`enumerate_rps`]).
pub fn enumerate_credentials(
    dev: &mut Session,
    pin: Option<&str>,
    rp_id_hash: &[u8],
) -> Result<Vec<ManagedCredential>> {
    token_for_management(dev, pin)?;
    let params = Value::Map(vec![(int(1), Value::Bytes(rp_id_hash.to_vec()))]);
    let first = match call(dev, CM_ENUMERATE_CREDENTIALS_BEGIN, Some(params), true) {
        Ok(map) => map.ok_or(Error::RxInvalidCbor)?,
        Err(Error::NoCredentials) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let total = map_get(&first, 9).and_then(cbor_to_u32).unwrap_or(1);
    let mut credentials = vec![parse_credential_entry(&first)?];
    for _ in 1..total {
        let map =
            call(dev, CM_ENUMERATE_CREDENTIALS_NEXT, None, false)?.ok_or(Error::RxInvalidCbor)?;
        credentials.push(parse_credential_entry(&map)?);
    }
    log::debug!("Enumerated {} credentials", credentials.len());
    Ok(credentials)
}

/// Delete a resident credential by id.
pub fn delete_credential(
    dev: &mut Session,
    pin: Option<&str>,
    credential_id: &[u8],
) -> Result<()> {
    log::debug!("Deleting credential: {}", hex::encode(credential_id));
    token_for_management(dev, pin)?;
    let descriptor = CredentialDescriptor {
        id: credential_id.to_vec(),
        public_key: None,
    };
    let params = Value::Map(vec![(int(2), crate::cred::descriptor_value(&descriptor))]);
    call(dev, CM_DELETE_CREDENTIAL, Some(params), true)?;
    log::info!("Credential deleted successfully");
    Ok(())
}

/// Replaces the user entity stored with a resident credential.
pub fn update_user_information(
    dev: &mut Session,
    pin: Option<&str>,
    credential_id: &[u8],
    user: &User,
) -> Result<()> {
    token_for_management(dev, pin)?;
    let descriptor = CredentialDescriptor {
        id: credential_id.to_vec(),
        public_key: None,
    };
    let params = Value::Map(vec![
        (int(2), crate::cred::descriptor_value(&descriptor)),
        (int(3), user_value(user)),
    ]);
    call(dev, CM_UPDATE_USER_INFORMATION, Some(params), true)?;
    Ok(())
}
