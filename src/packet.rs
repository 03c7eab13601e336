use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::util;

pub const ECHO_REQUEST: u8 = 8;
pub const ECHO_REPLY: u8 = 0;

/// Minimum ICMP message size; anything shorter after the IP header is junk.
pub const ICMP_HEADER_LEN: usize = 8;

/// Size of a serialized EchoMessage: 8-byte header + 8-byte timestamp.
pub const ECHO_PACKET_LEN: usize = 16;

/// Send/receive instant carried in the echo payload, seconds and
/// microseconds since the Unix epoch. Occupies the 8 payload bytes the
/// responder echoes back, so the reply itself tells us when it left.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Timestamp {
    pub secs: u32,
    pub micros: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0));

        Timestamp {
            secs: since_epoch.as_secs() as u32,
            micros: since_epoch.subsec_micros(),
        }
    }

    /// Elapsed time from `self` (send instant) to `now` (receive instant)
    /// in milliseconds. Computed in the signed microsecond domain, so a
    /// receive timestamp behind the send timestamp comes out negative
    /// rather than clamped; the caller decides what a clock anomaly means.
    pub fn elapsed_millis(&self, now: Timestamp) -> f64 {
        let sent = self.secs as i64 * 1_000_000 + self.micros as i64;
        let received = now.secs as i64 * 1_000_000 + now.micros as i64;

        (received - sent) as f64 / 1000.0
    }
}

/// ICMP echo message as it appears on the wire. Serialized with the
/// big-endian bincode coder, this is exactly `ECHO_PACKET_LEN` bytes:
/// type | code | checksum | identifier | sequence | timestamp.
#[derive(Serialize, Deserialize, Debug)]
pub struct EchoMessage {
    pub message_type: u8,
    pub message_code: u8,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence: u16,
    pub timestamp: Timestamp,
}

#[derive(Serialize, Deserialize)]
pub struct Ipv4Header {
    pub version_and_header_len: u8,
    pub type_of_service: u8,
    pub datagram_length: u16,
    pub ip_identifier: u16,
    pub flags_and_5frag_offset: u8, // flags are u3
    pub rest_of_frag_offset: u8,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source_ip: u32,
    pub destination_ip: u32,
}

impl Ipv4Header {
    /// Header length in bytes, decoded from the low nibble (length in
    /// 32-bit words) of the first byte.
    pub fn header_len(&self) -> usize {
        4 * (self.version_and_header_len & 0x0F) as usize
    }

    pub fn version(&self) -> u8 {
        self.version_and_header_len >> 4
    }
}

/// One successfully validated echo reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub source: IpAddr,
    pub sequence: u16,
    pub ttl: u8,
    pub size: usize,
    pub rtt_ms: f64,
}

/// Why a received datagram was discarded instead of yielding a ProbeResult.
/// None of these are fatal: foreign packets in particular are routine on a
/// shared raw socket.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// ICMP portion shorter than a minimal echo message.
    TooShort(usize),
    /// Message bytes do not verify against their own checksum field.
    ChecksumMismatch,
    /// ICMP type is something other than Echo Reply.
    NotAReply(u8),
    /// Echo Reply correlated to a different pinging session.
    ForeignPacket(u16),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::TooShort(len) => write!(f, "truncated icmp payload ({} bytes)", len),
            DecodeError::ChecksumMismatch => write!(f, "checksum verification failed"),
            DecodeError::NotAReply(t) => write!(f, "unexpected icmp type {}", t),
            DecodeError::ForeignPacket(id) => {
                write!(f, "identifier {:#06x} belongs to another session", id)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

// ICMP wire words are big endian
fn coder() -> bincode::Config {
    let mut coder = bincode::config();
    coder.big_endian();
    coder
}

/// Build a ready-to-transmit Echo Request carrying the given send instant.
/// Pure construction; the checksum is patched in after serialization.
pub fn build_echo_request(identifier: u16, sequence: u16, send_time: Timestamp) -> Vec<u8> {
    let message = EchoMessage {
        message_type: ECHO_REQUEST,
        message_code: 0,
        checksum: 0,
        identifier,
        sequence,
        timestamp: send_time,
    };

    // Serializing a fixed-layout struct to a Vec cannot fail
    let mut payload = coder().serialize(&message).unwrap();
    util::write_checksum(&mut payload);
    payload
}

/// Decode a received IP datagram into a ProbeResult, or say why it was
/// discarded. `now` is the receive instant, captured by the caller next to
/// the receive call; `source` is the datagram's sender as reported by the
/// transport. Pure over its inputs.
pub fn parse_echo_reply(
    buf: &[u8],
    expected_identifier: u16,
    now: Timestamp,
    source: IpAddr,
) -> Result<ProbeResult, DecodeError> {
    let ip = coder()
        .deserialize::<Ipv4Header>(buf)
        .map_err(|_| DecodeError::TooShort(buf.len()))?;

    let header_len = ip.header_len();
    if buf.len() < header_len + ICMP_HEADER_LEN {
        return Err(DecodeError::TooShort(buf.len().saturating_sub(header_len)));
    }

    // The ICMP portion is located right after the IP header
    let icmp_bytes = &buf[header_len..];

    // Re-summing with the stored checksum in place must give zero. Checked
    // before identity so a corrupt packet is never misreported as foreign.
    if util::checksum(icmp_bytes) != 0 {
        return Err(DecodeError::ChecksumMismatch);
    }

    // 8..15 bytes is a legal ICMP message but not an echo of ours
    let message = coder()
        .deserialize::<EchoMessage>(icmp_bytes)
        .map_err(|_| DecodeError::TooShort(icmp_bytes.len()))?;

    if message.message_type != ECHO_REPLY {
        return Err(DecodeError::NotAReply(message.message_type));
    }

    if message.identifier != expected_identifier {
        return Err(DecodeError::ForeignPacket(message.identifier));
    }

    Ok(ProbeResult {
        source,
        sequence: message.sequence,
        ttl: ip.ttl,
        size: icmp_bytes.len(),
        rtt_ms: message.timestamp.elapsed_millis(now),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::net::Ipv4Addr;

    pub(crate) const SOURCE: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));

    /// Wrap an ICMP echo request in a minimal IPv4 header, flipping the
    /// type to Echo Reply and fixing the checksum, as a responder would.
    pub(crate) fn reply_from_request(request: &[u8], ttl: u8) -> Vec<u8> {
        let mut icmp = request.to_vec();
        icmp[0] = ECHO_REPLY;
        util::write_checksum(&mut icmp);

        let mut datagram = vec![0u8; 20];
        datagram[0] = 0x45; // version 4, header length 5 words
        let total = (20 + icmp.len()) as u16;
        datagram[2..4].copy_from_slice(&total.to_be_bytes());
        datagram[8] = ttl;
        datagram[9] = 1; // IPPROTO_ICMP
        datagram.extend_from_slice(&icmp);
        datagram
    }

    #[test]
    fn request_layout_is_fixed() {
        let t0 = Timestamp { secs: 1, micros: 2 };
        let buf = build_echo_request(0x1234, 7, t0);

        assert_eq!(buf.len(), ECHO_PACKET_LEN);
        assert_eq!(buf[0], ECHO_REQUEST);
        assert_eq!(buf[1], 0);
        assert_eq!(&buf[4..6], &[0x12, 0x34]);
        assert_eq!(&buf[6..8], &[0x00, 0x07]);
        assert_eq!(&buf[8..12], &1u32.to_be_bytes());
        assert_eq!(&buf[12..16], &2u32.to_be_bytes());
        // stored checksum verifies over the whole message
        assert_eq!(util::checksum(&buf), 0);
    }

    #[test]
    fn encode_decode_round_trip() {
        let t0 = Timestamp { secs: 1000, micros: 250_000 };
        let request = build_echo_request(4321, 3, t0);
        let datagram = reply_from_request(&request, 64);

        let now = Timestamp { secs: 1000, micros: 260_000 };
        let result = parse_echo_reply(&datagram, 4321, now, SOURCE).unwrap();

        assert_eq!(result.sequence, 3);
        assert_eq!(result.ttl, 64);
        assert_eq!(result.size, ECHO_PACKET_LEN);
        assert_eq!(result.source, SOURCE);
        assert!((result.rtt_ms - 10.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_short_icmp_remainder() {
        let request = build_echo_request(1, 1, Timestamp::now());
        let mut datagram = reply_from_request(&request, 64);
        datagram.truncate(20 + 7);

        let err = parse_echo_reply(&datagram, 1, Timestamp::now(), SOURCE).unwrap_err();
        assert_eq!(err, DecodeError::TooShort(7));
    }

    #[test]
    fn rejects_buffer_smaller_than_ip_header() {
        let err = parse_echo_reply(&[0x45, 0x00], 1, Timestamp::now(), SOURCE).unwrap_err();
        assert_eq!(err, DecodeError::TooShort(2));
    }

    #[test]
    fn rejects_corrupt_checksum() {
        let request = build_echo_request(1, 1, Timestamp::now());
        let mut datagram = reply_from_request(&request, 64);
        datagram[20 + 5] ^= 0xFF; // flip a bit in the identifier

        let err = parse_echo_reply(&datagram, 1, Timestamp::now(), SOURCE).unwrap_err();
        assert_eq!(err, DecodeError::ChecksumMismatch);
    }

    #[test]
    fn rejects_non_reply_type() {
        // A looped-back request: type still 8, checksum valid
        let request = build_echo_request(1, 1, Timestamp::now());
        let mut datagram = reply_from_request(&request, 64);
        datagram[20] = ECHO_REQUEST;
        util::write_checksum(&mut datagram[20..]);

        let err = parse_echo_reply(&datagram, 1, Timestamp::now(), SOURCE).unwrap_err();
        assert_eq!(err, DecodeError::NotAReply(ECHO_REQUEST));
    }

    #[test]
    fn rejects_foreign_identifier_despite_valid_checksum() {
        let request = build_echo_request(0xBEEF, 1, Timestamp::now());
        let datagram = reply_from_request(&request, 64);
        assert_eq!(util::checksum(&datagram[20..]), 0);

        let err = parse_echo_reply(&datagram, 0x1234, Timestamp::now(), SOURCE).unwrap_err();
        assert_eq!(err, DecodeError::ForeignPacket(0xBEEF));
    }

    #[test]
    fn elapsed_millis_microsecond_resolution() {
        let sent = Timestamp { secs: 0, micros: 0 };
        let received = Timestamp { secs: 0, micros: 500_000 };
        assert_eq!(sent.elapsed_millis(received), 500.0);
    }

    #[test]
    fn elapsed_millis_borrows_across_seconds() {
        let sent = Timestamp { secs: 10, micros: 900_000 };
        let received = Timestamp { secs: 11, micros: 100_000 };
        assert_eq!(sent.elapsed_millis(received), 200.0);
    }

    #[test]
    fn elapsed_millis_negative_on_clock_anomaly() {
        let sent = Timestamp { secs: 5, micros: 0 };
        let received = Timestamp { secs: 4, micros: 0 };
        assert_eq!(sent.elapsed_millis(received), -1000.0);
    }

    #[test]
    fn ip_header_nibbles() {
        let request = build_echo_request(1, 1, Timestamp::now());
        let datagram = reply_from_request(&request, 64);
        let ip: Ipv4Header = super::coder().deserialize(&datagram).unwrap();

        assert_eq!(ip.version(), 4);
        assert_eq!(ip.header_len(), 20);
        assert_eq!(ip.protocol, 1);
    }
}
