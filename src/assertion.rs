//! Assertion generation: the authenticatorGetAssertion workflow,
//! getNextAssertion iteration across multiple eligible credentials,
//! signature verification against caller-supplied keys, and the
//! hmac-secret extension.

use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::elliptic_curve::generic_array::GenericArray;
use p256::EncodedPoint;
use serde::{Deserialize, Serialize};

use crate::cbor::{
    self, cbor_to_bool, cbor_to_bytes, cbor_to_i64, cbor_to_u64, int, map_get, map_get_text, Value,
};
use crate::cred::{
    descriptor_value, parse_auth_data, parse_user, sha256, AuthData, CredentialDescriptor, User,
};
use crate::error::{Error, Result};
use crate::pin::{self, permissions, SharedSecret};
use crate::session::{Session, CTAP2_GET_ASSERTION, CTAP2_GET_NEXT_ASSERTION};
use crate::u2f;

/// COSE algorithm identifier for ES256, the only algorithm verified
/// in-crate.
const COSE_ES256: i64 = -7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HmacSecretSalts {
    pub salt1: [u8; 32],
    pub salt2: Option<[u8; 32]>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetAssertionExtensions {
    pub hmac_secret: Option<HmacSecretSalts>,
    pub large_blob_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetAssertionArgs {
    pub rp_id: String,
    pub client_data_hash: [u8; 32],
    pub allow_list: Vec<CredentialDescriptor>,
    pub extensions: GetAssertionExtensions,
    pub user_presence: bool,
    pub user_verification: bool,
    pub pin: Option<String>,
}

impl Default for GetAssertionArgs {
    fn default() -> Self {
        GetAssertionArgs {
            rp_id: String::new(),
            client_data_hash: [0u8; 32],
            allow_list: Vec::new(),
            extensions: GetAssertionExtensions::default(),
            user_presence: true,
            user_verification: false,
            pin: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    pub credential_id: Vec<u8>,
    pub auth_data: AuthData,
    pub raw_auth_data: Vec<u8>,
    pub signature: Vec<u8>,
    pub user: Option<User>,
    pub user_selected: Option<bool>,
    pub large_blob_key: Option<Vec<u8>>,
    /// Decrypted hmac-secret extension output: one or two 32-byte values.
    pub hmac_secret: Option<Vec<u8>>,
}

/// Requests assertions for `args.rp_id`. When the authenticator reports
/// more than one eligible credential the remaining assertions are
/// fetched with getNextAssertion, back to back on the same channel, and
/// returned in authenticator order.
pub fn get_assertion(dev: &mut Session, args: &GetAssertionArgs) -> Result<Vec<Assertion>> {
    if args.rp_id.is_empty() {
        return Err(Error::InvalidArgument);
    }

    if !dev.is_fido2() {
        return u2f::sign(dev, args);
    }

    let mut uv_option = false;
    if args.pin.is_some() {
        pin::ensure_token(
            dev,
            permissions::GET_ASSERTION,
            Some(&args.rp_id),
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
            pin::ensure_token(dev, permissions::GET_ASSERTION, Some(&args.rp_id), None)?;
        }
    }

    // The hmac-secret salts travel encrypted under a fresh shared
    // secret, negotiated independently of any pinUvAuthToken.
    let mut hmac_ss: Option<SharedSecret> = None;
    let mut entries = vec![
        (int(1), Value::Text(args.rp_id.clone())),
        (int(2), Value::Bytes(args.client_data_hash.to_vec())),
    ];
    if !args.allow_list.is_empty() {
        entries.push((
            int(3),
            Value::Array(args.allow_list.iter().map(descriptor_value).collect()),
        ));
    }

    let mut ext = Vec::new();
    if let Some(salts) = &args.extensions.hmac_secret {
        let ss = pin::negotiate(dev)?;
        let mut salt = salts.salt1.to_vec();
        if let Some(salt2) = &salts.salt2 {
            salt.extend_from_slice(salt2);
        }
        let salt_enc = ss.encrypt(&salt)?;
        let salt_auth = ss.authenticate(&salt_enc);
        let mut hmac_entries = vec![
            (int(1), ss.key_agreement_value()),
            (int(2), Value::Bytes(salt_enc)),
            (int(3), Value::Bytes(salt_auth)),
        ];
        if ss.protocol().number() != 1 {
            hmac_entries.push((int(4), int(ss.protocol().number() as i64)));
        }
        ext.push((
            Value::Text("hmac-secret".into()),
            Value::Map(hmac_entries),
        ));
        hmac_ss = Some(ss);
    }
    if args.extensions.large_blob_key {
        ext.push((Value::Text("largeBlobKey".into()), Value::Bool(true)));
    }
    if !ext.is_empty() {
        entries.push((int(4), Value::Map(ext)));
    }

    // "up" defaults to true on the authenticator; it only goes on the
    // wire to turn presence off.
    if !args.user_presence || uv_option {
        let mut options = Vec::new();
        if !args.user_presence {
            options.push((Value::Text("up".into()), Value::Bool(false)));
        }
        if uv_option {
            options.push((Value::Text("uv".into()), Value::Bool(true)));
        }
        entries.push((int(5), Value::Map(options)));
    }

    if dev.token.is_some() {
        let (protocol, param) = pin::authenticate_with_token(dev, &args.client_data_hash)?;
        entries.push((int(6), Value::Bytes(param)));
        entries.push((int(7), int(protocol as i64)));
    }

    let reply = dev
        .cbor_call(CTAP2_GET_ASSERTION, Some(&Value::Map(entries)))?
        .ok_or(Error::RxInvalidCbor)?;
    let (first, count) = parse_assertion_reply(reply, hmac_ss.as_ref())?;

    let mut assertions = vec![first];
    for _ in 1..count {
        // getNextAssertion is only valid immediately after, on the same
        // channel; nothing else may run in between.
        let reply = dev
            .cbor_call(CTAP2_GET_NEXT_ASSERTION, None)?
            .ok_or(Error::RxInvalidCbor)?;
        let (next, _) = parse_assertion_reply(reply, hmac_ss.as_ref())?;
        assertions.push(next);
    }

    for assertion in &assertions {
        check_flags(assertion, args)?;
        if let Some(key) = args
            .allow_list
            .iter()
            .find(|d| d.id == assertion.credential_id)
            .and_then(|d| d.public_key.as_ref())
        {
            verify_assertion(assertion, &args.client_data_hash, key)?;
        }
    }

    Ok(assertions)
}

fn parse_assertion_reply(
    reply: Value,
    hmac_ss: Option<&SharedSecret>,
) -> Result<(Assertion, u64)> {
    let map = match reply {
        Value::Map(m) => m,
        _ => return Err(Error::RxInvalidCbor),
    };

    let credential_id = match map_get(&map, 1) {
        Some(Value::Map(descriptor)) => map_get_text(descriptor, "id")
            .and_then(cbor_to_bytes)
            .ok_or(Error::RxInvalidCbor)?,
        _ => return Err(Error::RxInvalidCbor),
    };
    let raw_auth_data = map_get(&map, 2)
        .and_then(cbor_to_bytes)
        .ok_or(Error::RxInvalidCbor)?;
    let signature = map_get(&map, 3)
        .and_then(cbor_to_bytes)
        .ok_or(Error::RxInvalidCbor)?;
    let auth_data = parse_auth_data(&raw_auth_data)?;

    let user = match map_get(&map, 4) {
        Some(Value::Map(user_map)) => Some(parse_user(user_map)),
        _ => None,
    };
    let count = map_get(&map, 5).and_then(cbor_to_u64).unwrap_or(1);

    let hmac_secret = match (&auth_data.extensions, hmac_ss) {
        (Some(Value::Map(ext)), Some(ss)) => {
            match map_get_text(ext, "hmac-secret").and_then(cbor_to_bytes) {
                Some(output) => Some(ss.decrypt(&output)?),
                None => None,
            }
        }
        _ => None,
    };

    Ok((
        Assertion {
            credential_id,
            auth_data,
            raw_auth_data,
            signature,
            user,
            user_selected: map_get(&map, 6).and_then(cbor_to_bool),
            large_blob_key: map_get(&map, 7).and_then(cbor_to_bytes),
            hmac_secret,
        },
        count,
    ))
}

/// The relying party and the requested UP/UV gates must be reflected in
/// the authenticator data; anything else is treated like a bad
/// signature.
fn check_flags(assertion: &Assertion, args: &GetAssertionArgs) -> Result<()> {
    if assertion.auth_data.rp_id_hash != sha256(args.rp_id.as_bytes()) {
        return Err(Error::RxInvalidSig);
    }
    if args.user_presence && !assertion.auth_data.user_present() {
        return Err(Error::RxInvalidSig);
    }
    if args.user_verification && !assertion.auth_data.user_verified() {
        return Err(Error::RxInvalidSig);
    }
    Ok(())
}

/// Verifies the assertion signature over `authData || clientDataHash`
/// against a COSE EC2 public key. Only ES256 is supported; other
/// algorithms surface `UnsupportedAlgorithm` so the caller can verify
/// externally.
pub fn verify_assertion(
    assertion: &Assertion,
    client_data_hash: &[u8; 32],
    public_key: &[(Value, Value)],
) -> Result<()> {
    let kty = map_get(public_key, 1).and_then(cbor_to_i64);
    let alg = map_get(public_key, 3).and_then(cbor_to_i64);
    let crv = map_get(public_key, -1).and_then(cbor_to_i64);
    if kty != Some(2) || crv != Some(1) || matches!(alg, Some(a) if a != COSE_ES256) {
        return Err(Error::UnsupportedAlgorithm);
    }

    let (x, y) = pin::parse_cose_ec2(public_key)?;
    let point = EncodedPoint::from_affine_coordinates(
        GenericArray::from_slice(&x),
        GenericArray::from_slice(&y),
        false,
    );
    let key = VerifyingKey::from_encoded_point(&point).map_err(|_| Error::UnsupportedAlgorithm)?;
    let signature = Signature::from_der(&assertion.signature).map_err(|_| Error::RxInvalidSig)?;

    let mut message = assertion.raw_auth_data.clone();
    message.extend_from_slice(client_data_hash);
    key.verify(&message, &signature)
        .map_err(|_| Error::RxInvalidSig)
}
