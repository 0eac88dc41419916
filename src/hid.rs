//! CTAPHID framing: fragmentation, reassembly, keep-alives and timeouts.
//!
//! A logical message travels as one INIT frame followed by up to 128
//! continuation frames, all tagged with the session's 32-bit channel id.
//! This module is pure protocol code over the [`Transport`] trait; it owns
//! no device state.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::transport::Transport;

/// CTAPHID commands
pub const CMD_MSG: u8 = 0x03;
pub const CMD_LOCK: u8 = 0x04;
pub const CMD_INIT: u8 = 0x06;
pub const CMD_WINK: u8 = 0x08;
pub const CMD_CBOR: u8 = 0x10;
pub const CMD_CANCEL: u8 = 0x11;
pub const CMD_KEEPALIVE: u8 = 0x3B;
pub const CMD_ERROR: u8 = 0x3F;

/// Capability bits reported by the INIT handshake.
pub const CAP_WINK: u8 = 0x01;
pub const CAP_CBOR: u8 = 0x04;
pub const CAP_NMSG: u8 = 0x08;

/// The broadcast channel used before a channel id has been assigned.
pub const CID_BROADCAST: u32 = 0xFFFF_FFFF;

/// Bit 7 of the command byte marks an INIT frame.
const TYPE_INIT: u8 = 0x80;

pub const REPORT_LEN: usize = 64;
pub const INIT_PAYLOAD_LEN: usize = REPORT_LEN - 7;
pub const CONT_PAYLOAD_LEN: usize = REPORT_LEN - 5;

/// Largest logical message: one INIT frame plus 128 continuations.
pub const MAX_MSG_LEN: usize = INIT_PAYLOAD_LEN + 128 * CONT_PAYLOAD_LEN;

/// Tracks the caller's read budget across keep-alives and foreign
/// frames. `-1` blocks indefinitely; `0` polls.
struct Deadline {
    expires: Option<Instant>,
    block: bool,
}

impl Deadline {
    fn new(timeout_ms: i32) -> Self {
        match timeout_ms {
            t if t < 0 => Deadline {
                expires: None,
                block: true,
            },
            0 => Deadline {
                expires: None,
                block: false,
            },
            t => Deadline {
                expires: Some(Instant::now() + Duration::from_millis(t as u64)),
                block: false,
            },
        }
    }

    /// Milliseconds left, in the convention `Transport::read` expects.
    fn remaining(&self) -> Result<i32> {
        if self.block {
            return Ok(-1);
        }
        match self.expires {
            None => Ok(0),
            Some(at) => {
                let left = at.saturating_duration_since(Instant::now()).as_millis();
                if left == 0 {
                    Err(Error::Timeout)
                } else {
                    Ok(left.min(i32::MAX as u128) as i32)
                }
            }
        }
    }
}

/// Splits a logical message into 64-byte CTAPHID frames.
pub fn fragment(cid: u32, cmd: u8, payload: &[u8]) -> Result<Vec<[u8; REPORT_LEN]>> {
    if payload.len() > MAX_MSG_LEN {
        return Err(Error::InvalidArgument);
    }

    let mut frames = Vec::with_capacity(1 + payload.len() / CONT_PAYLOAD_LEN);

    let mut init = [0u8; REPORT_LEN];
    init[0..4].copy_from_slice(&cid.to_be_bytes());
    init[4] = cmd | TYPE_INIT;
    init[5] = (payload.len() >> 8) as u8;
    init[6] = payload.len() as u8;
    let first = payload.len().min(INIT_PAYLOAD_LEN);
    init[7..7 + first].copy_from_slice(&payload[..first]);
    frames.push(init);

    let mut sent = first;
    let mut seq = 0u8;
    while sent < payload.len() {
        let mut cont = [0u8; REPORT_LEN];
        cont[0..4].copy_from_slice(&cid.to_be_bytes());
        cont[4] = seq;
        let chunk = (payload.len() - sent).min(CONT_PAYLOAD_LEN);
        cont[5..5 + chunk].copy_from_slice(&payload[sent..sent + chunk]);
        frames.push(cont);
        sent += chunk;
        seq += 1;
    }

    Ok(frames)
}

/// Writes a logical message, one report per frame.
pub fn send(transport: &mut dyn Transport, cid: u32, cmd: u8, payload: &[u8]) -> Result<()> {
    log::debug!(
        "CTAPHID send: cid=0x{:08x} cmd=0x{:02x} len={}",
        cid,
        cmd,
        payload.len()
    );
    for frame in fragment(cid, cmd, payload)? {
        let written = transport.write(&frame)?;
        if written != REPORT_LEN {
            return Err(Error::Tx(format!("short frame write: {} bytes", written)));
        }
    }
    Ok(())
}

fn read_frame(transport: &mut dyn Transport, deadline: &Deadline) -> Result<[u8; REPORT_LEN]> {
    let mut frame = [0u8; REPORT_LEN];
    let n = transport.read(&mut frame, deadline.remaining()?)?;
    if n == 0 {
        return Err(Error::Timeout);
    }
    Ok(frame)
}

/// Reads and reassembles one logical message addressed to `cid` carrying
/// `cmd`. KEEPALIVE frames are consumed without shrinking the budget
/// beyond elapsed wall time; frames on foreign channels are dropped
/// silently; an ERROR frame fails with its status byte.
pub fn recv(
    transport: &mut dyn Transport,
    cid: u32,
    cmd: u8,
    timeout_ms: i32,
) -> Result<Vec<u8>> {
    let deadline = Deadline::new(timeout_ms);

    let (bcnt, mut payload) = loop {
        let frame = read_frame(transport, &deadline)?;
        let frame_cid = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        if frame_cid != cid {
            log::debug!("Dropping frame on foreign channel 0x{:08x}", frame_cid);
            continue;
        }
        let frame_cmd = frame[4];
        if frame_cmd & TYPE_INIT == 0 {
            // Leftover continuation from an aborted exchange.
            log::debug!("Dropping stray continuation frame (seq {})", frame_cmd);
            continue;
        }
        match frame_cmd & !TYPE_INIT {
            CMD_KEEPALIVE => {
                log::debug!("Keep-alive, status 0x{:02x}", frame[7]);
                continue;
            }
            CMD_ERROR => return Err(Error::Transport(frame[7])),
            c if c == cmd => {
                let bcnt = ((frame[5] as usize) << 8) | frame[6] as usize;
                if bcnt > MAX_MSG_LEN {
                    return Err(Error::RxInvalidLen);
                }
                let take = bcnt.min(INIT_PAYLOAD_LEN);
                break (bcnt, frame[7..7 + take].to_vec());
            }
            other => {
                return Err(Error::Rx(format!(
                    "unexpected CTAPHID command 0x{:02x}",
                    other
                )))
            }
        }
    };

    let mut expected_seq = 0u8;
    while payload.len() < bcnt {
        let frame = read_frame(transport, &deadline)?;
        let frame_cid = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        if frame_cid != cid {
            log::debug!("Dropping frame on foreign channel 0x{:08x}", frame_cid);
            continue;
        }
        let seq = frame[4];
        if seq & TYPE_INIT != 0 {
            if seq & !TYPE_INIT == CMD_ERROR {
                return Err(Error::Transport(frame[7]));
            }
            return Err(Error::Rx("init frame during reassembly".to_string()));
        }
        if seq != expected_seq {
            return Err(Error::Rx(format!(
                "sequence mismatch: got {}, expected {}",
                seq, expected_seq
            )));
        }
        expected_seq += 1;
        let take = (bcnt - payload.len()).min(CONT_PAYLOAD_LEN);
        payload.extend_from_slice(&frame[5..5 + take]);
    }

    log::debug!(
        "CTAPHID recv: cid=0x{:08x} cmd=0x{:02x} len={}",
        cid,
        cmd,
        bcnt
    );
    Ok(payload)
}

/// One request/response exchange.
pub fn txn(
    transport: &mut dyn Transport,
    cid: u32,
    cmd: u8,
    payload: &[u8],
    timeout_ms: i32,
) -> Result<Vec<u8>> {
    send(transport, cid, cmd, payload)?;
    recv(transport, cid, cmd, timeout_ms)
}

/// Decoded CTAPHID_INIT reply.
#[derive(Debug, Clone, Copy)]
pub struct InitReply {
    pub nonce: [u8; 8],
    pub cid: u32,
    pub protocol: u8,
    pub major: u8,
    pub minor: u8,
    pub build: u8,
    pub caps: u8,
}

/// Runs the INIT exchange on the broadcast channel. The caller checks the
/// echoed nonce.
pub fn init(transport: &mut dyn Transport, nonce: [u8; 8], timeout_ms: i32) -> Result<InitReply> {
    let payload = txn(transport, CID_BROADCAST, CMD_INIT, &nonce, timeout_ms)?;
    if payload.len() < 17 {
        return Err(Error::RxInvalidLen);
    }
    let mut echoed = [0u8; 8];
    echoed.copy_from_slice(&payload[0..8]);
    Ok(InitReply {
        nonce: echoed,
        cid: u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]),
        protocol: payload[12],
        major: payload[13],
        minor: payload[14],
        build: payload[15],
        caps: payload[16],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedTransport;

    const CID: u32 = 0x1122_3344;

    #[test]
    fn test_fragment_200_bytes() {
        let payload: Vec<u8> = (0..200u8).collect();
        let frames = fragment(CID, CMD_CBOR, &payload).unwrap();
        assert_eq!(frames.len(), 4);

        // INIT frame: cid, cmd with bit 7, big-endian length, 57 payload bytes.
        assert_eq!(&frames[0][0..4], &CID.to_be_bytes());
        assert_eq!(frames[0][4], CMD_CBOR | 0x80);
        assert_eq!(frames[0][5], 0x00);
        assert_eq!(frames[0][6], 200);
        assert_eq!(&frames[0][7..64], &payload[..57]);

        // Continuations: seq 0 and 1 carry 59 bytes each, seq 2 the last 25
        // plus zero padding.
        assert_eq!(frames[1][4], 0);
        assert_eq!(&frames[1][5..64], &payload[57..116]);
        assert_eq!(frames[2][4], 1);
        assert_eq!(&frames[2][5..64], &payload[116..175]);
        assert_eq!(frames[3][4], 2);
        assert_eq!(&frames[3][5..30], &payload[175..200]);
        assert!(frames[3][30..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_framing_round_trip() {
        for len in [1usize, 57, 58, 200, 7609] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let mut transport = ScriptedTransport::new();
            transport.push_message(CID, CMD_CBOR, &payload);
            let out = recv(&mut transport, CID, CMD_CBOR, 1000).unwrap();
            assert_eq!(out, payload, "length {}", len);
        }
    }

    #[test]
    fn test_fragment_rejects_oversize() {
        assert_eq!(
            fragment(CID, CMD_CBOR, &vec![0u8; MAX_MSG_LEN + 1]),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn test_foreign_channel_dropped() {
        let mut transport = ScriptedTransport::new();
        transport.push_message(0xDEAD_BEEF, CMD_CBOR, &[0xAA; 32]);
        transport.push_message(CID, CMD_CBOR, &[0x55; 32]);
        let out = recv(&mut transport, CID, CMD_CBOR, 1000).unwrap();
        assert_eq!(out, vec![0x55; 32]);
    }

    #[test]
    fn test_keepalive_consumed() {
        let mut transport = ScriptedTransport::new();
        transport.push_keepalive(CID, 0x01);
        transport.push_keepalive(CID, 0x02);
        transport.push_message(CID, CMD_CBOR, &[0x11; 8]);
        let out = recv(&mut transport, CID, CMD_CBOR, 1000).unwrap();
        assert_eq!(out, vec![0x11; 8]);
    }

    #[test]
    fn test_error_frame_surfaces_status() {
        let mut transport = ScriptedTransport::new();
        transport.push_error(CID, 0x2A);
        assert_eq!(
            recv(&mut transport, CID, CMD_CBOR, 1000),
            Err(Error::Transport(0x2A))
        );
    }

    #[test]
    fn test_sequence_mismatch_fails() {
        let payload = vec![0x77u8; 120];
        let mut frames = fragment(CID, CMD_CBOR, &payload).unwrap();
        frames[1][4] = 1; // skip seq 0
        let mut transport = ScriptedTransport::new();
        for frame in frames {
            transport.push_frame(frame.to_vec());
        }
        match recv(&mut transport, CID, CMD_CBOR, 1000) {
            Err(Error::Rx(msg)) => assert!(msg.contains("sequence")),
            other => panic!("expected sequence error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversize_reply_rejected() {
        let mut frame = [0u8; REPORT_LEN];
        frame[0..4].copy_from_slice(&CID.to_be_bytes());
        frame[4] = CMD_CBOR | 0x80;
        frame[5] = 0x1D; // 7610
        frame[6] = 0xBA;
        let mut transport = ScriptedTransport::new();
        transport.push_frame(frame.to_vec());
        assert_eq!(
            recv(&mut transport, CID, CMD_CBOR, 1000),
            Err(Error::RxInvalidLen)
        );
    }

    #[test]
    fn test_empty_queue_times_out() {
        let mut transport = ScriptedTransport::new();
        assert_eq!(
            recv(&mut transport, CID, CMD_CBOR, 10),
            Err(Error::Timeout)
        );
    }
}
