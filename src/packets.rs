//! Framing layer of the remote debugging protocol.
//!
//! A packet on the wire is either a bare `+` (ACK), `-` (NACK), `0x03`
//! (interrupt request), or a framed payload `$<payload>#<hh>` where `hh` is
//! the modulo-256 sum of the payload bytes in hex. Payloads whose first byte
//! is `X` carry binary data and are surfaced with their raw bytes; everything
//! else is surfaced as text.

use memchr::memchr;

/// Sent on its own, outside any frame, to interrupt the debuggee.
pub const INTERRUPT_BYTE: u8 = 0x03;

const FRAME_START: u8 = b'$';
const FRAME_END: u8 = b'#';
const ESCAPE: u8 = b'}';

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Packet {
    Ack,
    Nack,
    Interrupt,
    /// A well-formed frame with a textual payload; each payload byte is
    /// widened to a character.
    Payload(String),
    /// A well-formed frame whose payload starts with `X`; bytes preserved
    /// verbatim (unescaping is the reader's business, not the framer's).
    BinaryPayload(Vec<u8>),
    /// A complete frame whose checksum field isn't two hex digits.
    InvalidPacket,
    /// A complete frame whose checksum doesn't match its payload.
    InvalidChecksum,
}

/// Modulo-256 sum of `payload`.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

pub(crate) fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Extracts the packets contained in `partial` + `new_data`.
///
/// Returns the packets in receipt order together with the bytes that must be
/// retained for the next call: once a `$` has been seen, everything from it
/// onwards stays buffered until the `#` terminator and both checksum digits
/// have arrived. Bytes between frames that aren't one of `+ - $ 0x03` are
/// synchronization noise and are skipped silently.
///
/// The framer is total: malformed checksum fields come back as
/// `Packet::InvalidPacket` / `Packet::InvalidChecksum` rather than errors.
/// Checksum verification can be disabled (e.g. after negotiating no-ack mode).
pub fn parse_packets(
    partial: &[u8],
    new_data: &[u8],
    check_checksums: bool,
) -> (Vec<Packet>, Vec<u8>) {
    let mut data = Vec::with_capacity(partial.len() + new_data.len());
    data.extend_from_slice(partial);
    data.extend_from_slice(new_data);

    let mut packets = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        match data[pos] {
            b'+' => {
                packets.push(Packet::Ack);
                pos += 1;
            }
            b'-' => {
                packets.push(Packet::Nack);
                pos += 1;
            }
            INTERRUPT_BYTE => {
                packets.push(Packet::Interrupt);
                pos += 1;
            }
            FRAME_START => match extract_frame(&data[pos..], check_checksums) {
                Some((packet, consumed)) => {
                    packets.push(packet);
                    pos += consumed;
                }
                None => break,
            },
            _ => pos += 1,
        }
    }
    (packets, data.split_off(pos))
}

/// `data` starts at a `$`. Returns the decoded packet and the number of bytes
/// consumed, or `None` while the terminator or checksum digits are missing.
fn extract_frame(data: &[u8], check_checksums: bool) -> Option<(Packet, usize)> {
    let end = memchr(FRAME_END, &data[1..])? + 1;
    if data.len() < end + 3 {
        return None;
    }
    let payload = &data[1..end];
    let consumed = end + 3;
    let sum = match (hex_digit(data[end + 1]), hex_digit(data[end + 2])) {
        (Some(hi), Some(lo)) => hi << 4 | lo,
        _ => return Some((Packet::InvalidPacket, consumed)),
    };
    if check_checksums && sum != checksum(payload) {
        return Some((Packet::InvalidChecksum, consumed));
    }
    let packet = if payload.first() == Some(&b'X') {
        Packet::BinaryPayload(payload.to_vec())
    } else {
        Packet::Payload(payload.iter().map(|&b| char::from(b)).collect())
    };
    Some((packet, consumed))
}

/// Builds a `$<payload>#<hh>` frame around `payload`.
pub fn frame_packet(payload: &[u8]) -> Vec<u8> {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(FRAME_START);
    out.extend_from_slice(payload);
    out.push(FRAME_END);
    let sum = checksum(payload);
    out.push(HEX[(sum >> 4) as usize]);
    out.push(HEX[(sum & 0xf) as usize]);
    out
}

fn must_escape(b: u8) -> bool {
    matches!(b, b'#' | b'$' | b'}' | b'*')
}

/// Escapes the bytes that are meaningful to the framer: each of `# $ } *`
/// becomes the two-byte sequence `}` followed by the byte xor 0x20.
pub fn escape_payload(payload: &[u8]) -> Vec<u8> {
    // Escaped bytes double in size; half again over the input covers
    // realistic binary payloads without a second pass to count.
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 2);
    for &b in payload {
        if must_escape(b) {
            out.push(ESCAPE);
            out.push(b ^ 0x20);
        } else {
            out.push(b);
        }
    }
    out
}

/// Undoes `escape_payload`. A lone `}` at the end of input stands for itself.
pub fn unescape_payload(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&b) = iter.next() {
        if b == ESCAPE {
            match iter.next() {
                Some(&escaped) => out.push(escaped ^ 0x20),
                None => out.push(ESCAPE),
            }
        } else {
            out.push(b);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Packet {
        Packet::Payload(s.to_owned())
    }

    #[test]
    fn framing_with_junk_between_packets() {
        let (packets, partial) = parse_packets(&[], b"qq+$OK#9a-\x03", true);
        assert_eq!(
            packets,
            vec![Packet::Ack, text("OK"), Packet::Nack, Packet::Interrupt]
        );
        assert!(partial.is_empty());
    }

    #[test]
    fn binary_payload_keeps_raw_bytes() {
        let frame = frame_packet(b"XABC");
        assert_eq!(frame, b"$XABC#1e".to_vec());
        let (packets, partial) = parse_packets(&[], &frame, true);
        assert_eq!(
            packets,
            vec![Packet::BinaryPayload(vec![0x58, 0x41, 0x42, 0x43])]
        );
        assert!(partial.is_empty());
    }

    #[test]
    fn framed_payload_identity() {
        for payload in &[&b""[..], b"OK", b"vCont;c", b"m4096,32", b"T05thread:1;"] {
            let (packets, partial) = parse_packets(&[], &frame_packet(payload), true);
            let as_text: String = payload.iter().map(|&b| char::from(b)).collect();
            assert_eq!(packets, vec![text(&as_text)], "payload {:?}", payload);
            assert!(partial.is_empty());
        }
    }

    #[test]
    fn frame_split_at_every_byte_boundary() {
        let mut stream = Vec::new();
        stream.extend_from_slice(b"+");
        stream.extend_from_slice(&frame_packet(b"g"));
        stream.extend_from_slice(&frame_packet(b"XA\x03B"));
        stream.extend_from_slice(b"-");
        let (expected, leftover) = parse_packets(&[], &stream, true);
        assert!(leftover.is_empty());

        for split in 0..=stream.len() {
            let (mut packets, partial) = parse_packets(&[], &stream[..split], true);
            let (rest, partial) = parse_packets(&partial, &stream[split..], true);
            packets.extend(rest);
            assert_eq!(packets, expected, "split at {}", split);
            assert!(partial.is_empty(), "split at {}", split);
        }
    }

    #[test]
    fn interrupt_byte_inside_frame_is_payload() {
        let frame = frame_packet(b"a\x03b");
        let (packets, _) = parse_packets(&[], &frame, true);
        assert_eq!(packets, vec![text("a\u{3}b")]);
    }

    #[test]
    fn incomplete_frame_stays_in_partial() {
        let (packets, partial) = parse_packets(&[], b"+$qSupp", true);
        assert_eq!(packets, vec![Packet::Ack]);
        assert_eq!(partial, b"$qSupp".to_vec());

        // Terminator present but only one checksum digit so far.
        let (packets, partial) = parse_packets(&partial, b"orted#a", true);
        assert!(packets.is_empty());
        assert_eq!(partial, b"$qSupported#a".to_vec());
    }

    #[test]
    fn checksum_mismatch_and_toggle() {
        let (packets, _) = parse_packets(&[], b"$OK#00", true);
        assert_eq!(packets, vec![Packet::InvalidChecksum]);
        let (packets, _) = parse_packets(&[], b"$OK#00", false);
        assert_eq!(packets, vec![text("OK")]);
    }

    #[test]
    fn non_hex_checksum_is_invalid_packet() {
        let (packets, partial) = parse_packets(&[], b"$OK#zz+", true);
        assert_eq!(packets, vec![Packet::InvalidPacket, Packet::Ack]);
        assert!(partial.is_empty());
    }

    #[test]
    fn escape_concrete_vector() {
        let encoded = escape_payload(&[0x23, 0x7d, 0x24, 0x2a]);
        assert_eq!(
            encoded,
            vec![0x7d, 0x03, 0x7d, 0x5d, 0x7d, 0x04, 0x7d, 0x0a]
        );
        assert_eq!(unescape_payload(&encoded), vec![0x23, 0x7d, 0x24, 0x2a]);
    }

    #[test]
    fn escape_round_trips_arbitrary_bytes() {
        let mut all = Vec::new();
        for b in 0..=255u8 {
            all.push(b);
        }
        assert_eq!(unescape_payload(&escape_payload(&all)), all);
    }

    #[test]
    fn lone_trailing_escape_decodes_to_itself() {
        assert_eq!(unescape_payload(b"abc}"), b"abc}".to_vec());
        assert_eq!(unescape_payload(b"}"), b"}".to_vec());
    }

    #[test]
    fn checksum_sums_modulo_256() {
        assert_eq!(checksum(b"OK"), 0x9a);
        assert_eq!(checksum(&[0xff, 0xff, 0x02]), 0x00);
        assert_eq!(checksum(b""), 0x00);
    }
}
