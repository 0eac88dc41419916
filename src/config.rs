//! authenticatorConfig subcommands. All of them mutate device policy and
//! are authenticated under the authenticator-config permission with a
//! MAC over `0xff x 32 || 0x0d || subCommand || subCommandParams`.

use crate::cbor::{self, int, Value};
use crate::error::{Error, Result};
use crate::pin::{self, permissions};
use crate::session::{Session, CTAP2_CONFIG};

const CONFIG_ENABLE_ENTERPRISE_ATTESTATION: u8 = 0x01;
const CONFIG_TOGGLE_ALWAYS_UV: u8 = 0x02;
const CONFIG_SET_MIN_PIN_LENGTH: u8 = 0x03;

fn call(
    dev: &mut Session,
    pin: Option<&str>,
    sub_command: u8,
    params: Option<Value>,
) -> Result<()> {
    pin::ensure_token(dev, permissions::AUTHENTICATOR_CONFIG, None, pin)?;

    let mut message = vec![0xFF; 32];
    message.push(CTAP2_CONFIG);
    message.push(sub_command);
    if let Some(params) = &params {
        message.extend_from_slice(&cbor::encode(params)?);
    }
    let (protocol, param) = pin::authenticate_with_token(dev, &message)?;

    let mut entries = vec![(int(1), int(sub_command as i64))];
    if let Some(params) = params {
        entries.push((int(2), params));
    }
    entries.push((int(3), int(protocol as i64)));
    entries.push((int(4), Value::Bytes(param)));

    dev.cbor_call(CTAP2_CONFIG, Some(&Value::Map(entries)))?;
    Ok(())
}

/// Turns on enterprise attestation; subsequent makeCredential calls may
/// request it.
pub fn enable_enterprise_attestation(dev: &mut Session, pin: Option<&str>) -> Result<()> {
    if dev.info().and_then(|i| i.option("ep")).is_none() {
        return Err(Error::UnsupportedOption);
    }
    call(dev, pin, CONFIG_ENABLE_ENTERPRISE_ATTESTATION, None)
}

/// Flips the alwaysUv policy.
pub fn toggle_always_uv(dev: &mut Session, pin: Option<&str>) -> Result<()> {
    if dev.info().and_then(|i| i.option("alwaysUv")).is_none() {
        return Err(Error::UnsupportedOption);
    }
    call(dev, pin, CONFIG_TOGGLE_ALWAYS_UV, None)
}

/// Raises the minimum PIN length, optionally granting `rp_ids` the right
/// to read it and forcing a PIN change on next use.
pub fn set_min_pin_length(
    dev: &mut Session,
    pin: Option<&str>,
    new_min_pin_length: Option<u32>,
    rp_ids: &[String],
    force_change_pin: bool,
) -> Result<()> {
    let mut params = Vec::new();
    if let Some(len) = new_min_pin_length {
        params.push((int(1), int(len as i64)));
    }
    if !rp_ids.is_empty() {
        params.push((
            int(2),
            Value::Array(rp_ids.iter().map(|id| Value::Text(id.clone())).collect()),
        ));
    }
    if force_change_pin {
        params.push((int(3), Value::Bool(true)));
    }
    let params = if params.is_empty() {
        None
    } else {
        Some(Value::Map(params))
    };
    call(dev, pin, CONFIG_SET_MIN_PIN_LENGTH, params)
}
