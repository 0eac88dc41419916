//! Biometric (fingerprint) enrollment: template capture with per-sample
//! feedback, enumeration, renaming and removal.

use serde::{Deserialize, Serialize};

use crate::cbor::{self, cbor_to_bytes, cbor_to_string, cbor_to_u32, cbor_to_u8, int, map_get, Value};
use crate::error::{Error, Result};
use crate::pin::{self, permissions};
use crate::session::{Session, CTAP2_BIO_ENROLLMENT, CTAP2_BIO_ENROLLMENT_PRE};

/// The only modality defined so far.
const MODALITY_FINGERPRINT: u8 = 0x01;

/// Bio enrollment subcommands
const BIO_ENROLL_BEGIN: u8 = 0x01;
const BIO_ENROLL_CAPTURE_NEXT_SAMPLE: u8 = 0x02;
const BIO_CANCEL_CURRENT_ENROLLMENT: u8 = 0x03;
const BIO_ENUMERATE_ENROLLMENTS: u8 = 0x04;
const BIO_SET_FRIENDLY_NAME: u8 = 0x05;
const BIO_REMOVE_ENROLLMENT: u8 = 0x06;
const BIO_GET_FINGERPRINT_SENSOR_INFO: u8 = 0x07;

/// Authenticator feedback for one capture attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleStatus {
    Good,
    TooHigh,
    TooLow,
    TooLeft,
    TooRight,
    TooFast,
    TooSlow,
    PoorQuality,
    TooSkewed,
    TooShort,
    MergeFailure,
    AlreadyExists,
    NoUserActivity,
    NoUserPresenceTransition,
    Unknown(u8),
}

impl From<u8> for SampleStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => SampleStatus::Good,
            0x01 => SampleStatus::TooHigh,
            0x02 => SampleStatus::TooLow,
            0x03 => SampleStatus::TooLeft,
            0x04 => SampleStatus::TooRight,
            0x05 => SampleStatus::TooFast,
            0x06 => SampleStatus::TooSlow,
            0x07 => SampleStatus::PoorQuality,
            0x08 => SampleStatus::TooSkewed,
            0x09 => SampleStatus::TooShort,
            0x0A => SampleStatus::MergeFailure,
            0x0B => SampleStatus::AlreadyExists,
            0x0D => SampleStatus::NoUserActivity,
            0x0E => SampleStatus::NoUserPresenceTransition,
            other => SampleStatus::Unknown(other),
        }
    }
}

/// State of an enrollment in progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollState {
    pub template_id: Vec<u8>,
    pub remaining_samples: u32,
    pub last_status: SampleStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub template_id: Vec<u8>,
    pub friendly_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorInfo {
    pub fingerprint_kind: Option<u32>,
    pub max_capture_samples: Option<u32>,
    pub max_friendly_name_len: Option<u32>,
}

fn command_byte(dev: &Session) -> u8 {
    match dev.info() {
        Some(info) if info.prototype_only() => CTAP2_BIO_ENROLLMENT_PRE,
        _ => CTAP2_BIO_ENROLLMENT,
    }
}

/// One bio-enrollment exchange. Authenticated subcommands carry a MAC
/// over `modality || subCommand || subCommandParams`.
fn call(
    dev: &mut Session,
    sub_command: u8,
    params: Option<Value>,
    authenticate: bool,
) -> Result<Option<Vec<(Value, Value)>>> {
    let cmd = command_byte(dev);
    let mut entries = vec![
        (int(1), int(MODALITY_FINGERPRINT as i64)),
        (int(2), int(sub_command as i64)),
    ];
    if let Some(params) = &params {
        entries.push((int(3), params.clone()));
    }

    if authenticate {
        let mut message = vec![MODALITY_FINGERPRINT, sub_command];
        if let Some(params) = &params {
            message.extend_from_slice(&cbor::encode(params)?);
        }
        let (protocol, param) = pin::authenticate_with_token(dev, &message)?;
        entries.push((int(4), int(protocol as i64)));
        entries.push((int(5), Value::Bytes(param)));
    }

    match dev.cbor_call(cmd, Some(&Value::Map(entries)))? {
        Some(Value::Map(map)) => Ok(Some(map)),
        Some(_) => Err(Error::RxInvalidCbor),
        None => Ok(None),
    }
}

fn token_for_bio(dev: &mut Session, pin: Option<&str>) -> Result<()> {
    pin::ensure_token(dev, permissions::BIO_ENROLLMENT, None, pin)
}

fn parse_enroll_state(map: &[(Value, Value)], template_id: Option<Vec<u8>>) -> Result<EnrollState> {
    let template_id = match template_id {
        Some(id) => id,
        None => map_get(map, 4)
            .and_then(cbor_to_bytes)
            .ok_or(Error::RxInvalidCbor)?,
    };
    Ok(EnrollState {
        template_id,
        remaining_samples: map_get(map, 6).and_then(cbor_to_u32).unwrap_or(0),
        last_status: map_get(map, 5)
            .and_then(cbor_to_u8)
            .map(SampleStatus::from)
            .ok_or(Error::RxInvalidCbor)?,
    })
}

/// Starts an enrollment; the first capture happens as part of this call.
pub fn enroll_begin(
    dev: &mut Session,
    pin: Option<&str>,
    timeout_ms: Option<u32>,
) -> Result<EnrollState> {
    token_for_bio(dev, pin)?;
    let params = timeout_ms.map(|t| Value::Map(vec![(int(3), int(t as i64))]));
    let map = call(dev, BIO_ENROLL_BEGIN, params, true)?.ok_or(Error::RxInvalidCbor)?;
    parse_enroll_state(&map, None)
}

/// Captures one more sample for the template started by
/// [`enroll_begin`].
pub fn enroll_capture_next(
    dev: &mut Session,
    template_id: &[u8],
    timeout_ms: Option<u32>,
) -> Result<EnrollState> {
    let mut params = vec![(int(1), Value::Bytes(template_id.to_vec()))];
    if let Some(t) = timeout_ms {
        params.push((int(3), int(t as i64)));
    }
    let map = call(
        dev,
        BIO_ENROLL_CAPTURE_NEXT_SAMPLE,
        Some(Value::Map(params)),
        true,
    )?
    .ok_or(Error::RxInvalidCbor)?;
    parse_enroll_state(&map, Some(template_id.to_vec()))
}

/// Runs a whole enrollment, capturing until the authenticator reports no
/// samples remaining. Per-sample feedback is handed to `progress`.
pub fn enroll(
    dev: &mut Session,
    pin: Option<&str>,
    timeout_ms: Option<u32>,
    mut progress: impl FnMut(&EnrollState),
) -> Result<Vec<u8>> {
    let mut state = enroll_begin(dev, pin, timeout_ms)?;
    progress(&state);
    while state.remaining_samples > 0 {
        let template_id = state.template_id.clone();
        state = enroll_capture_next(dev, &template_id, timeout_ms)?;
        progress(&state);
    }
    log::info!("Enrollment complete: {}", hex::encode(&state.template_id));
    Ok(state.template_id)
}

/// Abandons the enrollment in progress.
pub fn cancel_current_enrollment(dev: &mut Session) -> Result<()> {
    call(dev, BIO_CANCEL_CURRENT_ENROLLMENT, None, true)?;
    Ok(())
}

/// Lists enrolled templates.
pub fn enumerate_enrollments(dev: &mut Session, pin: Option<&str>) -> Result<Vec<Enrollment>> {
    token_for_bio(dev, pin)?;
    let map = match call(dev, BIO_ENUMERATE_ENROLLMENTS, None, true) {
        Ok(map) => map.ok_or(Error::RxInvalidCbor)?,
        Err(Error::InvalidArgument) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let infos = match map_get(&map, 7) {
        Some(Value::Array(infos)) => infos.clone(),
        _ => return Err(Error::RxInvalidCbor),
    };
    let mut enrollments = Vec::with_capacity(infos.len());
    for info in infos {
        if let Value::Map(entry) = info {
            enrollments.push(Enrollment {
                template_id: map_get(&entry, 1)
                    .and_then(cbor_to_bytes)
                    .ok_or(Error::RxInvalidCbor)?,
                friendly_name: map_get(&entry, 2).map(cbor_to_string),
            });
        }
    }
    Ok(enrollments)
}

/// Renames an enrolled template.
pub fn set_friendly_name(
    dev: &mut Session,
    pin: Option<&str>,
    template_id: &[u8],
    name: &str,
) -> Result<()> {
    token_for_bio(dev, pin)?;
    let params = Value::Map(vec![
        (int(1), Value::Bytes(template_id.to_vec())),
        (int(2), Value::Text(name.to_string())),
    ]);
    call(dev, BIO_SET_FRIENDLY_NAME, Some(params), true)?;
    Ok(())
}

/// Removes an enrolled template.
pub fn remove_enrollment(dev: &mut Session, pin: Option<&str>, template_id: &[u8]) -> Result<()> {
    token_for_bio(dev, pin)?;
    let params = Value::Map(vec![(int(1), Value::Bytes(template_id.to_vec()))]);
    call(dev, BIO_REMOVE_ENROLLMENT, Some(params), true)?;
    Ok(())
}

/// Sensor characteristics; not authenticated.
pub fn sensor_info(dev: &mut Session) -> Result<SensorInfo> {
    let map = call(dev, BIO_GET_FINGERPRINT_SENSOR_INFO, None, false)?
        .ok_or(Error::RxInvalidCbor)?;
    Ok(SensorInfo {
        fingerprint_kind: map_get(&map, 2).and_then(cbor_to_u32),
        max_capture_samples: map_get(&map, 3).and_then(cbor_to_u32),
        max_friendly_name_len: map_get(&map, 8).and_then(cbor_to_u32),
    })
}
