//! Decoding of the authenticatorGetInfo response. The decoded structure
//! drives protocol selection, fragment sizing and option gating in the
//! workflow modules.

use serde::{Deserialize, Serialize};

use crate::cbor::{
    cbor_to_bool, cbor_to_i64, cbor_to_string, cbor_to_u32, cbor_to_u8, Value,
};

/// FIDO2 authenticator information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthenticatorInfo {
    pub versions: Vec<String>,
    pub extensions: Vec<String>,
    pub aaguid: [u8; 16],
    pub options: Vec<(String, bool)>,
    pub max_msg_size: Option<u32>,
    pub pin_protocols: Vec<u8>,
    pub max_credential_count_in_list: Option<u32>,
    pub max_credential_id_length: Option<u32>,
    pub transports: Vec<String>,
    pub algorithms: Vec<i64>,
    pub max_large_blob: Option<u32>,
    pub force_pin_change: Option<bool>,
    pub min_pin_length: Option<u32>,
    pub firmware_version: Option<u32>,
    pub max_cred_blob_length: Option<u32>,
    pub max_rpids_for_set_min_pin_length: Option<u32>,
    pub preferred_platform_uv_attempts: Option<u32>,
    pub uv_modality: Option<u32>,
    pub remaining_discoverable_credentials: Option<u32>,
}

impl AuthenticatorInfo {
    pub(crate) fn parse(map: &[(Value, Value)]) -> Self {
        let mut info = AuthenticatorInfo::default();

        for (key, value) in map {
            let key_int = match cbor_to_i64(key) {
                Some(k) => k,
                None => {
                    log::warn!("Non-integer key in info map");
                    continue;
                }
            };
            match key_int {
                0x01 => {
                    if let Value::Array(arr) = value {
                        info.versions = arr.iter().map(cbor_to_string).collect();
                    }
                }
                0x02 => {
                    if let Value::Array(arr) = value {
                        info.extensions = arr.iter().map(cbor_to_string).collect();
                    }
                }
                0x03 => {
                    if let Value::Bytes(b) = value {
                        if b.len() == 16 {
                            info.aaguid.copy_from_slice(b);
                        }
                    }
                }
                0x04 => {
                    if let Value::Map(opts) = value {
                        for (opt_key, opt_value) in opts {
                            if let (Value::Text(name), Some(set)) =
                                (opt_key, cbor_to_bool(opt_value))
                            {
                                info.options.push((name.clone(), set));
                            }
                        }
                    }
                }
                0x05 => info.max_msg_size = cbor_to_u32(value),
                0x06 => {
                    if let Value::Array(arr) = value {
                        info.pin_protocols = arr.iter().filter_map(cbor_to_u8).collect();
                    }
                }
                0x07 => info.max_credential_count_in_list = cbor_to_u32(value),
                0x08 => info.max_credential_id_length = cbor_to_u32(value),
                0x09 => {
                    if let Value::Array(arr) = value {
                        info.transports = arr.iter().map(cbor_to_string).collect();
                    }
                }
                0x0A => {
                    // Array of {alg: <COSE id>, type: "public-key"} maps.
                    if let Value::Array(arr) = value {
                        for entry in arr {
                            if let Value::Map(alg_map) = entry {
                                for (alg_key, alg_value) in alg_map {
                                    if let Value::Text(k) = alg_key {
                                        if k == "alg" {
                                            if let Some(alg) = cbor_to_i64(alg_value) {
                                                if !info.algorithms.contains(&alg) {
                                                    info.algorithms.push(alg);
                                                }
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
                0x0B => info.max_large_blob = cbor_to_u32(value),
                0x0C => info.force_pin_change = cbor_to_bool(value),
                0x0D => info.min_pin_length = cbor_to_u32(value),
                0x0E => info.firmware_version = cbor_to_u32(value),
                0x0F => info.max_cred_blob_length = cbor_to_u32(value),
                0x10 => info.max_rpids_for_set_min_pin_length = cbor_to_u32(value),
                0x11 => info.preferred_platform_uv_attempts = cbor_to_u32(value),
                0x12 => info.uv_modality = cbor_to_u32(value),
                0x14 => info.remaining_discoverable_credentials = cbor_to_u32(value),
                other => {
                    log::debug!("Unknown info key: {}", other);
                }
            }
        }

        info
    }

    /// Tri-state option lookup: absent means the authenticator does not
    /// know the option at all.
    pub fn option(&self, name: &str) -> Option<bool> {
        self.options
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, set)| *set)
    }

    pub fn supports_version(&self, version: &str) -> bool {
        self.versions.iter().any(|v| v == version)
    }

    pub fn supports_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|e| e == name)
    }

    /// Largest largeBlobs fragment the authenticator accepts.
    pub fn max_fragment_length(&self) -> usize {
        self.max_msg_size.unwrap_or(1024).saturating_sub(64) as usize
    }

    /// True when only the credential-management / bio-enrollment
    /// prototype command bytes are available.
    pub fn prototype_only(&self) -> bool {
        self.supports_version("FIDO_2_1_PRE")
            && !self.supports_version("FIDO_2_1")
    }
}
