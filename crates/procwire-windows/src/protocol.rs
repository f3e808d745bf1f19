//! Wire format spoken with the process wrapper.
//!
//! Every stdio socket opens with a client hello
//! `HANDSHAKE, pid: u32 BE, stream_id: u8, client_token[N]`, answered by
//! `HANDSHAKE_ACK, status` (plus the server token on success), and confirmed
//! by the client with `HANDSHAKE_ACK, status`. Afterwards the stdin socket
//! carries two 5-byte packets: `CHILD_PID, pid: u32 BE` then
//! `EXIT_CODE, code: u32 BE`.

use procwire_core::{ProcessError, Result};
use std::fmt;
use tokio_util::bytes::{Buf, BufMut, BytesMut};

pub const SIGNAL_HANDSHAKE: u8 = 0x01;
pub const SIGNAL_HANDSHAKE_ACK: u8 = 0x02;
pub const SIGNAL_CHILD_PID: u8 = 0x03;
pub const SIGNAL_EXIT_CODE: u8 = 0x04;

pub const PACKET_LEN: usize = 5;
pub const CLIENT_ACK_LEN: usize = 2;

/// Status byte of a `HANDSHAKE_ACK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandshakeStatus {
    Success = 0x00,
    SignalUnexpected = 0x01,
    InvalidStreamId = 0x02,
    InvalidProcessId = 0x03,
    DuplicateStreamId = 0x04,
    InvalidClientToken = 0x05,
    AckWriteError = 0x06,
    AckStatusError = 0x07,
    NoLongerPending = 0x08,
}

impl HandshakeStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let status = match code {
            0x00 => HandshakeStatus::Success,
            0x01 => HandshakeStatus::SignalUnexpected,
            0x02 => HandshakeStatus::InvalidStreamId,
            0x03 => HandshakeStatus::InvalidProcessId,
            0x04 => HandshakeStatus::DuplicateStreamId,
            0x05 => HandshakeStatus::InvalidClientToken,
            0x06 => HandshakeStatus::AckWriteError,
            0x07 => HandshakeStatus::AckStatusError,
            0x08 => HandshakeStatus::NoLongerPending,
            _ => return None,
        };
        Some(status)
    }
}

impl fmt::Display for HandshakeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            HandshakeStatus::Success => "success",
            HandshakeStatus::SignalUnexpected => "unexpected signal",
            HandshakeStatus::InvalidStreamId => "invalid stream id",
            HandshakeStatus::InvalidProcessId => "invalid process id",
            HandshakeStatus::DuplicateStreamId => "duplicate stream id",
            HandshakeStatus::InvalidClientToken => "invalid client token",
            HandshakeStatus::AckWriteError => "could not write handshake ack",
            HandshakeStatus::AckStatusError => "client rejected server token",
            HandshakeStatus::NoLongerPending => "process is no longer pending",
        };
        f.write_str(text)
    }
}

/// Which stdio stream a socket carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamId {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
}

impl StreamId {
    pub const ALL: [StreamId; 3] = [StreamId::Stdin, StreamId::Stdout, StreamId::Stderr];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for StreamId {
    type Error = HandshakeStatus;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(StreamId::Stdin),
            1 => Ok(StreamId::Stdout),
            2 => Ok(StreamId::Stderr),
            _ => Err(HandshakeStatus::InvalidStreamId),
        }
    }
}

/// First message on every wrapper socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub signal: u8,
    pub pid: u32,
    pub stream_id: u8,
    pub token: Vec<u8>,
}

impl ClientHello {
    pub fn encoded_len(token_size: usize) -> usize {
        1 + 4 + 1 + token_size
    }

    pub fn new(pid: u32, stream: StreamId, token: &[u8]) -> Self {
        Self {
            signal: SIGNAL_HANDSHAKE,
            pid,
            stream_id: stream as u8,
            token: token.to_vec(),
        }
    }

    /// Parses a hello of exactly `encoded_len(token_size)` bytes.
    ///
    /// The signal and stream id are not validated here.
    pub fn decode(mut buf: &[u8], token_size: usize) -> Option<Self> {
        if buf.len() != Self::encoded_len(token_size) {
            return None;
        }

        let signal = buf.get_u8();
        let pid = buf.get_u32();
        let stream_id = buf.get_u8();
        Some(Self {
            signal,
            pid,
            stream_id,
            token: buf.to_vec(),
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::encoded_len(self.token.len()));
        buf.put_u8(self.signal);
        buf.put_u32(self.pid);
        buf.put_u8(self.stream_id);
        buf.put_slice(&self.token);
        buf
    }
}

/// Server reply to a hello. The server token follows only on success.
pub fn encode_server_ack(status: HandshakeStatus, server_token: Option<&[u8]>) -> BytesMut {
    let token = server_token.unwrap_or_default();
    let mut buf = BytesMut::with_capacity(2 + token.len());
    buf.put_u8(SIGNAL_HANDSHAKE_ACK);
    buf.put_u8(status.code());
    buf.put_slice(token);
    buf
}

/// Validates the client's confirmation of the server token.
pub fn decode_client_ack(buf: [u8; CLIENT_ACK_LEN]) -> std::result::Result<(), HandshakeStatus> {
    match buf {
        [SIGNAL_HANDSHAKE_ACK, status] if status == HandshakeStatus::Success.code() => Ok(()),
        _ => Err(HandshakeStatus::AckStatusError),
    }
}

pub fn encode_packet(signal: u8, value: u32) -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0] = signal;
    packet[1..].copy_from_slice(&value.to_be_bytes());
    packet
}

/// Reads the value of a 5-byte packet that must carry `expected` as its signal.
pub fn decode_packet(packet: [u8; PACKET_LEN], expected: u8) -> Result<u32> {
    let mut buf = &packet[..];
    let signal = buf.get_u8();
    if signal != expected {
        return Err(ProcessError::Handshake(format!(
            "expected signal {expected:#04x}, received {signal:#04x}"
        )));
    }
    Ok(buf.get_u32())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_layout() {
        let hello = ClientHello::new(0x0102_0304, StreamId::Stderr, &[0xAA; 4]);
        let bytes = hello.encode();

        assert_eq!(
            &bytes[..],
            &[SIGNAL_HANDSHAKE, 0x01, 0x02, 0x03, 0x04, 0x02, 0xAA, 0xAA, 0xAA, 0xAA]
        );
        assert_eq!(ClientHello::decode(&bytes, 4), Some(hello));
        assert_eq!(ClientHello::decode(&bytes, 5), None);
    }

    #[test]
    fn test_server_ack_layout() {
        let ok = encode_server_ack(HandshakeStatus::Success, Some(b"srv"));
        assert_eq!(&ok[..], &[SIGNAL_HANDSHAKE_ACK, 0x00, b's', b'r', b'v']);

        let rejected = encode_server_ack(HandshakeStatus::InvalidClientToken, None);
        assert_eq!(&rejected[..], &[SIGNAL_HANDSHAKE_ACK, 0x05]);
    }

    #[test]
    fn test_client_ack_must_confirm_success() {
        assert!(decode_client_ack([SIGNAL_HANDSHAKE_ACK, 0x00]).is_ok());
        assert_eq!(
            decode_client_ack([SIGNAL_HANDSHAKE_ACK, 0x05]),
            Err(HandshakeStatus::AckStatusError)
        );
        assert_eq!(
            decode_client_ack([SIGNAL_HANDSHAKE, 0x00]),
            Err(HandshakeStatus::AckStatusError)
        );
    }

    #[test]
    fn test_packets() {
        let packet = encode_packet(SIGNAL_EXIT_CODE, 42);
        assert_eq!(packet, [SIGNAL_EXIT_CODE, 0, 0, 0, 42]);
        assert_eq!(decode_packet(packet, SIGNAL_EXIT_CODE).unwrap(), 42);

        let error = decode_packet(packet, SIGNAL_CHILD_PID).unwrap_err();
        assert!(error.is_start_failure());
    }

    #[test]
    fn test_status_codes() {
        for code in 0x00..=0x08 {
            let status = HandshakeStatus::from_code(code).unwrap();
            assert_eq!(status.code(), code);
        }
        assert_eq!(HandshakeStatus::from_code(0x09), None);
        assert_eq!(StreamId::try_from(3), Err(HandshakeStatus::InvalidStreamId));
        assert_eq!(StreamId::try_from(1), Ok(StreamId::Stdout));
    }
}
