//! Test support: a scripted transport that replays canned HID reports and
//! records everything the library writes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::cbor::{self, Value};
use crate::error::Result;
use crate::hid;
use crate::session::Session;
use crate::transport::Transport;

#[derive(Default)]
struct Inner {
    replies: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    opened: bool,
}

/// Cloneable handle; the session owns one clone, the test keeps another
/// to queue replies and inspect traffic.
#[derive(Clone)]
pub(crate) struct ScriptedTransport {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        ScriptedTransport {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Queues one raw 64-byte report.
    pub fn push_frame(&self, frame: Vec<u8>) {
        self.inner.lock().unwrap().replies.push_back(frame);
    }

    /// Queues a logical message, fragmented exactly as a device would
    /// send it.
    pub fn push_message(&self, cid: u32, cmd: u8, payload: &[u8]) {
        for frame in hid::fragment(cid, cmd, payload).unwrap() {
            self.push_frame(frame.to_vec());
        }
    }

    pub fn push_keepalive(&self, cid: u32, status: u8) {
        let mut frame = vec![0u8; hid::REPORT_LEN];
        frame[0..4].copy_from_slice(&cid.to_be_bytes());
        frame[4] = hid::CMD_KEEPALIVE | 0x80;
        frame[6] = 1;
        frame[7] = status;
        self.push_frame(frame);
    }

    pub fn push_error(&self, cid: u32, code: u8) {
        let mut frame = vec![0u8; hid::REPORT_LEN];
        frame[0..4].copy_from_slice(&cid.to_be_bytes());
        frame[4] = hid::CMD_ERROR | 0x80;
        frame[6] = 1;
        frame[7] = code;
        self.push_frame(frame);
    }

    /// Queues a CTAP2 reply: status byte plus optional CBOR body.
    pub fn push_cbor_reply(&self, cid: u32, status: u8, body: Option<&Value>) {
        let mut payload = vec![status];
        if let Some(value) = body {
            payload.extend_from_slice(&cbor::encode(value).unwrap());
        }
        self.push_message(cid, hid::CMD_CBOR, &payload);
    }

    /// Queues an INIT handshake reply for `nonce`.
    pub fn push_init_reply(&self, nonce: [u8; 8], cid: u32, caps: u8) {
        let mut payload = Vec::with_capacity(17);
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&cid.to_be_bytes());
        payload.extend_from_slice(&[2, 1, 0, 0, caps]);
        self.push_message(hid::CID_BROADCAST, hid::CMD_INIT, &payload);
    }

    pub fn is_opened(&self) -> bool {
        self.inner.lock().unwrap().opened
    }

    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().written.clone()
    }

    /// Every logical message written so far as `(cmd, payload)`,
    /// reassembled from the recorded frames in order.
    pub fn sent_messages(&self) -> Vec<(u8, Vec<u8>)> {
        let written = self.written_frames();
        let mut messages = Vec::new();
        let mut iter = written.iter();
        while let Some(frame) = iter.next() {
            let cmd = frame[4] & 0x7F;
            let bcnt = ((frame[5] as usize) << 8) | frame[6] as usize;
            let mut payload = frame[7..7 + bcnt.min(hid::INIT_PAYLOAD_LEN)].to_vec();
            while payload.len() < bcnt {
                let cont = iter.next().expect("missing continuation frame");
                let take = (bcnt - payload.len()).min(hid::CONT_PAYLOAD_LEN);
                payload.extend_from_slice(&cont[5..5 + take]);
            }
            messages.push((cmd, payload));
        }
        messages
    }

    /// The CTAP2 request payloads (command byte plus CBOR body) sent so
    /// far, skipping the CTAPHID INIT handshake.
    pub fn sent_cbor_requests(&self) -> Vec<(u8, Vec<u8>)> {
        self.sent_messages()
            .into_iter()
            .filter(|(cmd, _)| *cmd == hid::CMD_CBOR)
            .map(|(_, payload)| (payload[0], payload[1..].to_vec()))
            .collect()
    }
}

impl Transport for ScriptedTransport {
    fn open(&mut self, _path: &str) -> Result<()> {
        self.inner.lock().unwrap().opened = true;
        Ok(())
    }

    fn close(&mut self) {
        self.inner.lock().unwrap().opened = false;
    }

    fn read(&mut self, buf: &mut [u8], _timeout_ms: i32) -> Result<usize> {
        match self.inner.lock().unwrap().replies.pop_front() {
            Some(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.lock().unwrap().written.push(buf.to_vec());
        Ok(buf.len())
    }
}

pub(crate) const TEST_NONCE: [u8; 8] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
pub(crate) const TEST_CID: u32 = 0xCAFE_BABE;

/// A plausible getInfo body: FIDO_2_0 + FIDO_2_1, both PIN protocols,
/// clientPin set, credMgmt, bioEnroll and largeBlobs on.
pub(crate) fn default_info() -> Value {
    Value::Map(vec![
        (
            cbor::int(1),
            Value::Array(vec![
                Value::Text("FIDO_2_0".into()),
                Value::Text("FIDO_2_1".into()),
            ]),
        ),
        (
            cbor::int(2),
            Value::Array(vec![
                Value::Text("hmac-secret".into()),
                Value::Text("largeBlobKey".into()),
            ]),
        ),
        (cbor::int(3), Value::Bytes(vec![0xA5; 16])),
        (
            cbor::int(4),
            Value::Map(vec![
                (Value::Text("rk".into()), Value::Bool(true)),
                (Value::Text("up".into()), Value::Bool(true)),
                (Value::Text("clientPin".into()), Value::Bool(true)),
                (Value::Text("credMgmt".into()), Value::Bool(true)),
                (Value::Text("largeBlobs".into()), Value::Bool(true)),
                (Value::Text("bioEnroll".into()), Value::Bool(true)),
            ]),
        ),
        (cbor::int(5), cbor::int(1200)),
        (cbor::int(6), Value::Array(vec![cbor::int(2), cbor::int(1)])),
        (cbor::int(0x0B), cbor::int(1024)),
    ])
}

/// A fixed COSE EC2 key for synthesized attested credential data.
pub(crate) fn sample_cose_key() -> Value {
    Value::Map(vec![
        (cbor::int(1), cbor::int(2)),
        (cbor::int(3), cbor::int(-7)),
        (cbor::int(-1), cbor::int(1)),
        (cbor::int(-2), Value::Bytes(vec![0x11; 32])),
        (cbor::int(-3), Value::Bytes(vec![0x22; 32])),
    ])
}

/// Synthesizes authenticator data for `rp_id` with the given flag bits;
/// attested credential data (aaguid 0xB0.., credential id 0xC1..16) is
/// appended when the AT flag is present.
pub(crate) fn sample_auth_data(rp_id: &str, flags: u8) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&crate::cred::sha256(rp_id.as_bytes()));
    data.push(flags);
    data.extend_from_slice(&7u32.to_be_bytes());
    if flags & crate::cred::FLAG_AT != 0 {
        data.extend_from_slice(&[0xB0; 16]);
        data.extend_from_slice(&16u16.to_be_bytes());
        data.extend_from_slice(&[0xC1; 16]);
        data.extend_from_slice(&cbor::encode(&sample_cose_key()).unwrap());
    }
    data
}

/// Opens a session against a fresh scripted transport. The INIT
/// handshake and getInfo replies are queued automatically; further
/// replies are queued on the returned handle.
pub(crate) fn open_session() -> (Session, ScriptedTransport) {
    open_session_with_info(&default_info())
}

/// Like [`open_session`], with a caller-supplied getInfo body.
pub(crate) fn open_session_with_info(info: &Value) -> (Session, ScriptedTransport) {
    let transport = ScriptedTransport::new();
    transport.push_init_reply(TEST_NONCE, TEST_CID, hid::CAP_WINK | hid::CAP_CBOR);
    transport.push_cbor_reply(TEST_CID, 0, Some(info));

    let mut session = Session::new();
    session.set_test_nonce(TEST_NONCE);
    session.set_transport(Box::new(transport.clone())).unwrap();
    session.open("scripted").unwrap();
    (session, transport)
}
