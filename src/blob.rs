//! Large-blob array transfer. The authenticator stores one opaque byte
//! array whose last 16 bytes are a truncated SHA-256 over the rest;
//! reads and writes move maxFragmentLength-sized pieces. Per-credential
//! decryption with the largeBlobKey is up to the caller.

use sha2::{Digest, Sha256};

use crate::cbor::{self, cbor_to_bytes, int, map_get, Value};
use crate::error::{Error, Result};
use crate::pin::{self, permissions};
use crate::session::{Session, CTAP2_LARGE_BLOBS};

/// Trailing integrity checksum length.
const TRUNCATED_HASH_LEN: usize = 16;

fn truncated_hash(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize()[..TRUNCATED_HASH_LEN].to_vec()
}

fn supports_large_blobs(dev: &Session) -> Result<usize> {
    let info = dev.info().ok_or(Error::UnsupportedOption)?;
    if info.option("largeBlobs") != Some(true) {
        return Err(Error::UnsupportedOption);
    }
    Ok(info.max_fragment_length())
}

/// Reads the serialized large-blob array, verifies the trailing
/// checksum, and returns the body with the checksum stripped.
pub fn get_large_blob_array(dev: &mut Session) -> Result<Vec<u8>> {
    let fragment_len = supports_large_blobs(dev)?;

    let mut serialized = Vec::new();
    loop {
        let request = Value::Map(vec![
            (int(1), int(fragment_len as i64)),
            (int(3), int(serialized.len() as i64)),
        ]);
        let reply = dev
            .cbor_call(CTAP2_LARGE_BLOBS, Some(&request))?
            .ok_or(Error::RxInvalidCbor)?;
        let map = match reply {
            Value::Map(m) => m,
            _ => return Err(Error::RxInvalidCbor),
        };
        let chunk = map_get(&map, 1)
            .and_then(cbor_to_bytes)
            .ok_or(Error::RxInvalidCbor)?;
        let done = chunk.len() < fragment_len;
        serialized.extend_from_slice(&chunk);
        if done {
            break;
        }
    }

    if serialized.len() < TRUNCATED_HASH_LEN + 1 {
        return Err(Error::RxInvalidLen);
    }
    let body_len = serialized.len() - TRUNCATED_HASH_LEN;
    if truncated_hash(&serialized[..body_len]) != serialized[body_len..] {
        return Err(Error::IntegrityFailure);
    }
    serialized.truncate(body_len);
    log::debug!("Read large-blob array: {} bytes", serialized.len());
    Ok(serialized)
}

/// Writes `body` as the new large-blob array, appending the checksum and
/// authenticating every fragment under the large-blob-write permission.
pub fn set_large_blob_array(dev: &mut Session, pin: Option<&str>, body: &[u8]) -> Result<()> {
    let fragment_len = supports_large_blobs(dev)?;
    let max = dev.info().and_then(|i| i.max_large_blob).unwrap_or(0) as usize;

    let mut serialized = body.to_vec();
    serialized.extend_from_slice(&truncated_hash(body));
    if max != 0 && serialized.len() > max {
        return Err(Error::LargeBlobStorageFull);
    }

    pin::ensure_token(dev, permissions::LARGE_BLOB_WRITE, None, pin)?;

    let total = serialized.len();
    let mut offset = 0;
    while offset < total {
        let chunk = &serialized[offset..(offset + fragment_len).min(total)];

        // MAC input fixed by the protocol:
        // 32 x 0xff || 0x0c 0x00 || uint32le(offset) || SHA-256(chunk).
        let mut message = vec![0xFF; 32];
        message.extend_from_slice(&[0x0C, 0x00]);
        message.extend_from_slice(&(offset as u32).to_le_bytes());
        let mut hasher = Sha256::new();
        hasher.update(chunk);
        message.extend_from_slice(&hasher.finalize());
        let (protocol, param) = pin::authenticate_with_token(dev, &message)?;

        let mut entries = vec![
            (int(2), Value::Bytes(chunk.to_vec())),
            (int(3), int(offset as i64)),
        ];
        if offset == 0 {
            entries.push((int(4), int(total as i64)));
        }
        entries.push((int(5), Value::Bytes(param)));
        entries.push((int(6), int(protocol as i64)));

        dev.cbor_call(CTAP2_LARGE_BLOBS, Some(&Value::Map(entries)))?;
        offset += chunk.len();
    }

    log::debug!("Wrote large-blob array: {} bytes", total);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cbor::cbor_to_u32;
    use crate::pin::{hmac_authenticate, PinUvAuthProtocol};
    use crate::testutil::{open_session_with_info, TEST_CID};
    use zeroize::Zeroizing;

    const TOKEN: [u8; 32] = [0x5A; 32];

    /// maxMsgSize 128 gives the 64-byte fragments of the read scenario.
    fn small_fragment_info() -> Value {
        Value::Map(vec![
            (int(1), Value::Array(vec![Value::Text("FIDO_2_1".into())])),
            (
                int(4),
                Value::Map(vec![
                    (Value::Text("largeBlobs".into()), Value::Bool(true)),
                    (Value::Text("clientPin".into()), Value::Bool(true)),
                ]),
            ),
            (int(5), int(128)),
            (int(6), Value::Array(vec![int(2)])),
            (int(0x0B), int(1024)),
        ])
    }

    fn serialized_array(body_len: usize) -> Vec<u8> {
        let body: Vec<u8> = (0..body_len).map(|i| i as u8).collect();
        let mut serialized = body;
        let hash = truncated_hash(&serialized);
        serialized.extend_from_slice(&hash);
        serialized
    }

    #[test]
    fn test_get_reads_fragments_at_increasing_offsets() {
        let (mut dev, transport) = open_session_with_info(&small_fragment_info());
        // 150-byte serialized array (134-byte body + checksum) read in
        // 64-byte fragments.
        let serialized = serialized_array(134);
        assert_eq!(serialized.len(), 150);
        for chunk in serialized.chunks(64) {
            transport.push_cbor_reply(
                TEST_CID,
                0,
                Some(&Value::Map(vec![(int(1), Value::Bytes(chunk.to_vec()))])),
            );
        }

        let body = get_large_blob_array(&mut dev).unwrap();
        assert_eq!(body, serialized[..134].to_vec());

        let requests = transport.sent_cbor_requests();
        let gets: Vec<(u32, u32)> = requests[1..]
            .iter()
            .map(|(cmd, body)| {
                assert_eq!(*cmd, CTAP2_LARGE_BLOBS);
                let (value, _) = cbor::decode(body).unwrap();
                match value {
                    Value::Map(m) => (
                        map_get(&m, 1).and_then(cbor_to_u32).unwrap(),
                        map_get(&m, 3).and_then(cbor_to_u32).unwrap(),
                    ),
                    _ => panic!("expected map"),
                }
            })
            .collect();
        assert_eq!(gets, vec![(64, 0), (64, 64), (64, 128)]);
    }

    #[test]
    fn test_get_rejects_bad_checksum() {
        let (mut dev, transport) = open_session_with_info(&small_fragment_info());
        let mut serialized = serialized_array(20);
        *serialized.last_mut().unwrap() ^= 0x01;
        transport.push_cbor_reply(
            TEST_CID,
            0,
            Some(&Value::Map(vec![(int(1), Value::Bytes(serialized))])),
        );
        assert_eq!(
            get_large_blob_array(&mut dev),
            Err(Error::IntegrityFailure)
        );
    }

    #[test]
    fn test_get_rejects_short_array() {
        let (mut dev, transport) = open_session_with_info(&small_fragment_info());
        transport.push_cbor_reply(
            TEST_CID,
            0,
            Some(&Value::Map(vec![(int(1), Value::Bytes(vec![0u8; 16]))])),
        );
        assert_eq!(get_large_blob_array(&mut dev), Err(Error::RxInvalidLen));
    }

    #[test]
    fn test_set_fragments_and_authenticates() {
        let (mut dev, transport) = open_session_with_info(&small_fragment_info());
        dev.token = Some(Zeroizing::new(TOKEN.to_vec()));
        dev.token_protocol = Some(PinUvAuthProtocol::Two);

        let body: Vec<u8> = (0..100u8).collect(); // 116 bytes serialized
        transport.push_cbor_reply(TEST_CID, 0, None);
        transport.push_cbor_reply(TEST_CID, 0, None);
        set_large_blob_array(&mut dev, None, &body).unwrap();

        let requests = transport.sent_cbor_requests();
        assert_eq!(requests.len(), 3); // getInfo + 2 fragments

        let mut serialized = body.clone();
        serialized.extend_from_slice(&truncated_hash(&body));

        for (i, (offset, chunk)) in [(0usize, &serialized[..64]), (64, &serialized[64..])]
            .iter()
            .enumerate()
        {
            let (_, request_body) = &requests[1 + i];
            let (value, _) = cbor::decode(request_body).unwrap();
            let map = match value {
                Value::Map(m) => m,
                _ => panic!("expected map"),
            };
            assert_eq!(map_get(&map, 2).and_then(cbor_to_bytes).unwrap(), *chunk);
            assert_eq!(map_get(&map, 3).and_then(cbor_to_u32), Some(*offset as u32));
            if *offset == 0 {
                assert_eq!(map_get(&map, 4).and_then(cbor_to_u32), Some(116));
            } else {
                assert!(map_get(&map, 4).is_none());
            }

            let mut message = vec![0xFF; 32];
            message.extend_from_slice(&[0x0C, 0x00]);
            message.extend_from_slice(&(*offset as u32).to_le_bytes());
            let mut hasher = Sha256::new();
            hasher.update(chunk);
            message.extend_from_slice(&hasher.finalize());
            let expected = hmac_authenticate(PinUvAuthProtocol::Two, &TOKEN, &message);
            assert_eq!(map_get(&map, 5).and_then(cbor_to_bytes), Some(expected));
        }
    }

    #[test]
    fn test_set_rejects_oversize() {
        let (mut dev, _transport) = open_session_with_info(&small_fragment_info());
        dev.token = Some(Zeroizing::new(TOKEN.to_vec()));
        dev.token_protocol = Some(PinUvAuthProtocol::Two);
        assert_eq!(
            set_large_blob_array(&mut dev, None, &vec![0u8; 2048]),
            Err(Error::LargeBlobStorageFull)
        );
    }

    #[test]
    fn test_unsupported_without_option() {
        let info = Value::Map(vec![(
            int(1),
            Value::Array(vec![Value::Text("FIDO_2_0".into())]),
        )]);
        let (mut dev, _transport) = open_session_with_info(&info);
        assert_eq!(get_large_blob_array(&mut dev), Err(Error::UnsupportedOption));
    }
}
