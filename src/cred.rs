//! Credential creation: the authenticatorMakeCredential workflow,
//! authenticator-data parsing, and structural validation of the returned
//! attestation statement.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cbor::{
    self, cbor_to_bool, cbor_to_bytes, cbor_to_string, cbor_to_i64, int, map_get, map_get_text,
    Value,
};
use crate::error::{Error, Result};
use crate::pin::{self, permissions};
use crate::session::{Session, CTAP2_MAKE_CREDENTIAL};
use crate::u2f;

/// Authenticator data flag bits.
pub const FLAG_UP: u8 = 0x01;
pub const FLAG_UV: u8 = 0x04;
pub const FLAG_AT: u8 = 0x40;
pub const FLAG_ED: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelyingParty {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Vec<u8>,
    pub name: Option<String>,
    pub display_name: Option<String>,
}

/// An entry of an allow or exclude list. The type is always public-key.
/// The optional public key never goes on the wire; it feeds assertion
/// verification on the way back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialDescriptor {
    pub id: Vec<u8>,
    pub public_key: Option<Vec<(Value, Value)>>,
}

/// Fixed-prefix part of authenticator data plus the optional attested
/// credential and extension output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthData {
    pub rp_id_hash: [u8; 32],
    pub flags: u8,
    pub sign_count: u32,
    pub attested_credential: Option<AttestedCredential>,
    pub extensions: Option<Value>,
}

impl AuthData {
    pub fn user_present(&self) -> bool {
        self.flags & FLAG_UP != 0
    }

    pub fn user_verified(&self) -> bool {
        self.flags & FLAG_UV != 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestedCredential {
    pub aaguid: [u8; 16],
    pub credential_id: Vec<u8>,
    pub public_key: Vec<(Value, Value)>,
}

/// The decoded attestation statement. Which fields are populated depends
/// on the format; signature verification against a trust root is the
/// caller's business.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttestationStatement {
    pub alg: Option<i64>,
    pub sig: Option<Vec<u8>>,
    pub x5c: Vec<Vec<u8>>,
    pub ver: Option<String>,
    pub cert_info: Option<Vec<u8>>,
    pub pub_area: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attestation {
    pub format: String,
    pub auth_data: AuthData,
    pub raw_auth_data: Vec<u8>,
    pub statement: AttestationStatement,
    pub enterprise: bool,
    pub large_blob_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MakeCredentialExtensions {
    pub cred_protect: Option<u8>,
    pub hmac_secret: bool,
    pub cred_blob: Option<Vec<u8>>,
    pub min_pin_length: bool,
    pub large_blob_key: bool,
}

impl MakeCredentialExtensions {
    fn is_empty(&self) -> bool {
        self.cred_protect.is_none()
            && !self.hmac_secret
            && self.cred_blob.is_none()
            && !self.min_pin_length
            && !self.large_blob_key
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MakeCredentialArgs {
    pub rp: RelyingParty,
    pub user: User,
    pub client_data_hash: [u8; 32],
    /// COSE algorithm identifiers in preference order.
    pub algorithms: Vec<i64>,
    pub exclude_list: Vec<CredentialDescriptor>,
    pub extensions: MakeCredentialExtensions,
    pub resident_key: bool,
    pub user_verification: bool,
    pub pin: Option<String>,
    pub enterprise_attestation: Option<u8>,
}

pub(crate) fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub(crate) fn rp_value(rp: &RelyingParty) -> Value {
    let mut entries = vec![(Value::Text("id".into()), Value::Text(rp.id.clone()))];
    if let Some(name) = &rp.name {
        entries.push((Value::Text("name".into()), Value::Text(name.clone())));
    }
    Value::Map(entries)
}

pub(crate) fn user_value(user: &User) -> Value {
    let mut entries = vec![(Value::Text("id".into()), Value::Bytes(user.id.clone()))];
    if let Some(name) = &user.name {
        entries.push((Value::Text("name".into()), Value::Text(name.clone())));
    }
    if let Some(display_name) = &user.display_name {
        entries.push((
            Value::Text("displayName".into()),
            Value::Text(display_name.clone()),
        ));
    }
    Value::Map(entries)
}

pub(crate) fn descriptor_value(descriptor: &CredentialDescriptor) -> Value {
    Value::Map(vec![
        (Value::Text("id".into()), Value::Bytes(descriptor.id.clone())),
        (
            Value::Text("type".into()),
            Value::Text("public-key".into()),
        ),
    ])
}

pub(crate) fn parse_user(map: &[(Value, Value)]) -> User {
    User {
        id: map_get_text(map, "id").and_then(cbor_to_bytes).unwrap_or_default(),
        name: map_get_text(map, "name").map(cbor_to_string),
        display_name: map_get_text(map, "displayName").map(cbor_to_string),
    }
}

/// Parses authenticator data: 37-byte fixed prefix, then attested
/// credential data when the AT flag is set, then the extension map when
/// ED is set. The credential public key must be canonically encoded.
pub(crate) fn parse_auth_data(raw: &[u8]) -> Result<AuthData> {
    if raw.len() < 37 {
        return Err(Error::RxInvalidLen);
    }
    let mut rp_id_hash = [0u8; 32];
    rp_id_hash.copy_from_slice(&raw[0..32]);
    let flags = raw[32];
    let sign_count = u32::from_be_bytes([raw[33], raw[34], raw[35], raw[36]]);

    let mut offset = 37;
    let attested_credential = if flags & FLAG_AT != 0 {
        if raw.len() < offset + 18 {
            return Err(Error::RxInvalidLen);
        }
        let mut aaguid = [0u8; 16];
        aaguid.copy_from_slice(&raw[offset..offset + 16]);
        let cred_len =
            ((raw[offset + 16] as usize) << 8) | raw[offset + 17] as usize;
        offset += 18;
        if raw.len() < offset + cred_len {
            return Err(Error::RxInvalidLen);
        }
        let credential_id = raw[offset..offset + cred_len].to_vec();
        offset += cred_len;

        let (key_value, consumed) =
            cbor::decode(&raw[offset..]).map_err(|_| Error::RxInvalidCbor)?;
        if cbor::encode(&key_value)? != raw[offset..offset + consumed] {
            return Err(Error::RxInvalidCbor);
        }
        offset += consumed;
        let public_key = match key_value {
            Value::Map(m) => m,
            _ => return Err(Error::RxInvalidCbor),
        };
        Some(AttestedCredential {
            aaguid,
            credential_id,
            public_key,
        })
    } else {
        None
    };

    let extensions = if flags & FLAG_ED != 0 {
        let (value, consumed) =
            cbor::decode(&raw[offset..]).map_err(|_| Error::RxInvalidCbor)?;
        offset += consumed;
        Some(value)
    } else {
        None
    };

    if offset != raw.len() {
        return Err(Error::RxInvalidLen);
    }

    Ok(AuthData {
        rp_id_hash,
        flags,
        sign_count,
        attested_credential,
        extensions,
    })
}

fn statement_bytes(map: &[(Value, Value)], key: &str) -> Option<Vec<u8>> {
    map_get_text(map, key).and_then(cbor_to_bytes)
}

fn statement_chain(map: &[(Value, Value)]) -> Option<Vec<Vec<u8>>> {
    match map_get_text(map, "x5c") {
        Some(Value::Array(items)) => {
            let chain: Option<Vec<Vec<u8>>> = items.iter().map(cbor_to_bytes).collect();
            chain.filter(|c| !c.is_empty())
        }
        _ => None,
    }
}

/// Validates the attestation statement shape for `format` and pulls the
/// fields out.
pub(crate) fn parse_statement(
    format: &str,
    map: &[(Value, Value)],
) -> Result<AttestationStatement> {
    let mut stmt = AttestationStatement {
        alg: map_get_text(map, "alg").and_then(|v| cbor_to_i64(v)),
        sig: statement_bytes(map, "sig"),
        x5c: statement_chain(map).unwrap_or_default(),
        ver: map_get_text(map, "ver").map(cbor_to_string),
        cert_info: statement_bytes(map, "certInfo"),
        pub_area: statement_bytes(map, "pubArea"),
    };

    let shape_ok = match format {
        "packed" => stmt.alg.is_some() && stmt.sig.is_some(),
        "fido-u2f" => stmt.sig.is_some() && !stmt.x5c.is_empty(),
        "tpm" => {
            stmt.alg.is_some()
                && stmt.sig.is_some()
                && !stmt.x5c.is_empty()
                && stmt.ver.as_deref() == Some("2.0")
                && stmt.cert_info.is_some()
                && stmt.pub_area.is_some()
        }
        "none" => {
            stmt = AttestationStatement::default();
            map.is_empty()
        }
        "apple" => !stmt.x5c.is_empty(),
        _ => return Err(Error::UnsupportedOption),
    };

    if !shape_ok {
        return Err(Error::RxInvalidCbor);
    }
    Ok(stmt)
}

/// Creates a credential. When the session lacks CBOR capability the
/// request goes down the legacy U2F register path instead.
pub fn make_credential(dev: &mut Session, args: &MakeCredentialArgs) -> Result<Attestation> {
    if args.rp.id.is_empty() || args.algorithms.is_empty() || args.user.id.is_empty() {
        return Err(Error::InvalidArgument);
    }

    if !dev.is_fido2() {
        return u2f::register(dev, args);
    }

    // Decide between a pinUvAuthToken and the plain uv option.
    let mut uv_option = false;
    if args.pin.is_some() {
        pin::ensure_token(
            dev,
            permissions::MAKE_CREDENTIAL,
            Some(&args.rp.id),
            args.pin.as_deref(),
        )?;
    } else if args.user_verification {
        let builtin_uv = dev.info().and_then(|i| i.option("uv")).unwrap_or(false);
        let permission_tokens = dev
            .info()
            .and_then(|i| i.option("pinUvAuthToken"))
            .unwrap_or(false);
        if builtin_uv && !permission_tokens {
            uv_option = true;
        } else {
            pin::ensure_token(dev, permissions::MAKE_CREDENTIAL, Some(&args.rp.id), None)?;
        }
    }

    let mut entries = vec![
        (int(1), Value::Bytes(args.client_data_hash.to_vec())),
        (int(2), rp_value(&args.rp)),
        (int(3), user_value(&args.user)),
        (
            int(4),
            Value::Array(
                args.algorithms
                    .iter()
                    .map(|alg| {
                        Value::Map(vec![
                            (Value::Text("alg".into()), int(*alg)),
                            (
                                Value::Text("type".into()),
                                Value::Text("public-key".into()),
                            ),
                        ])
                    })
                    .collect(),
            ),
        ),
    ];

    if !args.exclude_list.is_empty() {
        entries.push((
            int(5),
            Value::Array(args.exclude_list.iter().map(descriptor_value).collect()),
        ));
    }

    if !args.extensions.is_empty() {
        let mut ext = Vec::new();
        if let Some(level) = args.extensions.cred_protect {
            ext.push((Value::Text("credProtect".into()), int(level as i64)));
        }
        if args.extensions.hmac_secret {
            ext.push((Value::Text("hmac-secret".into()), Value::Bool(true)));
        }
        if let Some(blob) = &args.extensions.cred_blob {
            ext.push((Value::Text("credBlob".into()), Value::Bytes(blob.clone())));
        }
        if args.extensions.min_pin_length {
            ext.push((Value::Text("minPinLength".into()), Value::Bool(true)));
        }
        if args.extensions.large_blob_key {
            ext.push((Value::Text("largeBlobKey".into()), Value::Bool(true)));
        }
        entries.push((int(6), Value::Map(ext)));
    }

    if args.resident_key || uv_option {
        let mut options = Vec::new();
        if args.resident_key {
            options.push((Value::Text("rk".into()), Value::Bool(true)));
        }
        if uv_option {
            options.push((Value::Text("uv".into()), Value::Bool(true)));
        }
        entries.push((int(7), Value::Map(options)));
    }

    if dev.token.is_some() {
        let (protocol, param) = pin::authenticate_with_token(dev, &args.client_data_hash)?;
        entries.push((int(8), Value::Bytes(param)));
        entries.push((int(9), int(protocol as i64)));
    }

    if let Some(ea) = args.enterprise_attestation {
        entries.push((int(0x0A), int(ea as i64)));
    }

    let reply = dev
        .cbor_call(CTAP2_MAKE_CREDENTIAL, Some(&Value::Map(entries)))?
        .ok_or(Error::RxInvalidCbor)?;
    let map = match reply {
        Value::Map(m) => m,
        _ => return Err(Error::RxInvalidCbor),
    };

    let format = map_get(&map, 1)
        .map(cbor_to_string)
        .ok_or(Error::RxInvalidCbor)?;
    let raw_auth_data = map_get(&map, 2)
        .and_then(cbor_to_bytes)
        .ok_or(Error::RxInvalidCbor)?;
    let statement = match map_get(&map, 3) {
        Some(Value::Map(stmt)) => parse_statement(&format, stmt)?,
        _ => return Err(Error::RxInvalidCbor),
    };

    let auth_data = parse_auth_data(&raw_auth_data)?;
    // The attestation must carry a fresh credential for our relying
    // party; anything else means the reply was not produced for this
    // request.
    if auth_data.rp_id_hash != sha256(args.rp.id.as_bytes()) {
        return Err(Error::RxInvalidSig);
    }
    if auth_data.attested_credential.is_none() {
        return Err(Error::RxInvalidCbor);
    }

    Ok(Attestation {
        format,
        auth_data,
        raw_auth_data,
        statement,
        enterprise: map_get(&map, 4).and_then(cbor_to_bool).unwrap_or(false),
        large_blob_key: map_get(&map, 5).and_then(cbor_to_bytes),
    })
}
