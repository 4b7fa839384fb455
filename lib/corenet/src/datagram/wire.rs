//! Datagram wire format and sequence-number arithmetic (spec §4.3 "Wire format",
//! "Sequence arithmetic", "Safe packet size"). Pure and synchronous — no sockets, no
//! clocks — so it's testable without a runtime.
//!
//! Resolving an ambiguity the spec leaves implicit: the frame layout
//! `[id, partNum, (partCount), tokenPrefix(2), content…]` and the stated usable-payload
//! budget (506/505/506 out of `MAX_SAFE_PACKET_SIZE = 508`) only agree if the 2-byte token
//! prefix is carried on *inbound* (client→server) frames only — spec §4.3 itself calls it
//! "2 bytes of token prefix on incoming frames (server-side bookkeeping)". A server has no
//! need to prove its own identity back to a client that already holds the session token, so
//! outbound frames drop the prefix and get the full 506/505/506 budget the spec's numbers
//! assume. This is recorded as a §9 Open Question resolution in DESIGN.md.
use crate::config::ProtocolLimits;
use crate::error::{CoreError, CoreResult};
use flux::TOKEN_PREFIX_SIZE;

/// A parsed inbound datagram (client → server), before any session/history bookkeeping.
#[derive(Debug, PartialEq, Eq)]
pub enum InboundFrame {
    /// Bare `[0]`.
    Ping,
    /// `[0]` followed by the 48-byte session token.
    Handshake([u8; flux::TOKEN_SIZE]),
    /// A data frame. `content` absent (`None`) means this is the peer's ack for `id`.
    Data {
        id: u8,
        part_num: u8,
        part_count: Option<u8>,
        token_prefix: [u8; TOKEN_PREFIX_SIZE],
        content: Option<Vec<u8>>,
    },
}

pub fn parse_inbound(bytes: &[u8]) -> CoreResult<InboundFrame> {
    let (&id, rest) = bytes.split_first().ok_or(CoreError::MalformedFrame("empty datagram"))?;

    if id == 0 {
        return match rest.len() {
            0 => Ok(InboundFrame::Ping),
            flux::TOKEN_SIZE => {
                let mut token = [0u8; flux::TOKEN_SIZE];
                token.copy_from_slice(rest);
                Ok(InboundFrame::Handshake(token))
            }
            _ => Err(CoreError::MalformedFrame("id 0 with unrecognized trailing length")),
        };
    }

    let (&part_num, rest) = rest.split_first().ok_or(CoreError::MalformedFrame("missing partNum"))?;

    let (part_count, rest) = if part_num == 1 {
        let (&count, rest) = rest.split_first().ok_or(CoreError::MalformedFrame("missing partCount"))?;
        (Some(count), rest)
    } else {
        (None, rest)
    };

    if rest.len() < TOKEN_PREFIX_SIZE {
        return Err(CoreError::MalformedFrame("missing token prefix"));
    }
    let (prefix_bytes, content_bytes) = rest.split_at(TOKEN_PREFIX_SIZE);
    let mut token_prefix = [0u8; TOKEN_PREFIX_SIZE];
    token_prefix.copy_from_slice(prefix_bytes);

    let content = if content_bytes.is_empty() { None } else { Some(content_bytes.to_vec()) };

    Ok(InboundFrame::Data { id, part_num, part_count, token_prefix, content })
}

/// `[0]`, sent by the server as a liveness ping or as an ack for a client's handshake.
pub fn encode_outbound_ping() -> Vec<u8> {
    vec![0]
}

/// Exactly `[0, 0]`: unknown token on handshake, or token-prefix mismatch on a data frame.
pub fn encode_outbound_error() -> Vec<u8> {
    vec![0, 0]
}

/// An outbound ack is an outbound data frame with no content.
pub fn encode_outbound_ack(id: u8) -> Vec<u8> {
    encode_outbound_data_part(id, 0, None, &[])
}

/// `[id, partNum, (partCount if partNum==1), content…]` — no token prefix (see module docs).
pub fn encode_outbound_data_part(id: u8, part_num: u8, part_count: Option<u8>, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + content.len());
    out.push(id);
    out.push(part_num);
    if part_num == 1 {
        out.push(part_count.unwrap_or(1));
    }
    out.extend_from_slice(content);
    out
}

/// An inbound ack is an inbound data frame with no content — used by test fixtures that
/// simulate a client replying to the server.
pub fn encode_inbound_ack(id: u8, part_num: u8, part_count: Option<u8>, token_prefix: [u8; TOKEN_PREFIX_SIZE]) -> Vec<u8> {
    encode_inbound_data_part(id, part_num, part_count, token_prefix, &[])
}

pub fn encode_inbound_data_part(
    id: u8,
    part_num: u8,
    part_count: Option<u8>,
    token_prefix: [u8; TOKEN_PREFIX_SIZE],
    content: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + content.len());
    out.push(id);
    out.push(part_num);
    if part_num == 1 {
        out.push(part_count.unwrap_or(1));
    }
    out.extend_from_slice(&token_prefix);
    out.extend_from_slice(content);
    out
}

pub fn encode_inbound_handshake(token: &[u8; flux::TOKEN_SIZE]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + flux::TOKEN_SIZE);
    out.push(0);
    out.extend_from_slice(token);
    out
}

/// Ids advance 1→2→…→255→1; 0 never participates in data flow (spec §4.3).
pub fn next_id(id: u8) -> u8 {
    if id >= 255 {
        1
    } else {
        id + 1
    }
}

/// Circular "is `a` strictly before `b`" over the 1..=255 id space, window ≤ 255
/// (spec §4.3 "Sequence arithmetic").
pub fn precedes(a: u8, b: u8) -> bool {
    if a == b {
        return false;
    }
    let forward_distance = (b as i32 - a as i32).rem_euclid(255);
    forward_distance != 0 && forward_distance < 255
}

/// Splits `buf` into content chunks sized to fit the outbound first/subsequent-part payload
/// limits (spec §4.3 "Safe packet size"). A buffer fitting in one subsequent-sized chunk is
/// a single part (`partNum == 0`, no count byte, full 506-byte budget).
pub fn split_into_parts<'a>(buf: &'a [u8], limits: &ProtocolLimits) -> CoreResult<Vec<&'a [u8]>> {
    let first_limit = limits.usable_first_part_bytes();
    let subsequent_limit = limits.usable_subsequent_part_bytes();

    if buf.len() <= subsequent_limit {
        return Ok(vec![buf]);
    }

    let max_len = first_limit + subsequent_limit * 254;
    if buf.len() > max_len {
        return Err(CoreError::MalformedFrame("message exceeds maximum representable length"));
    }

    let mut parts = Vec::new();
    let (head, mut rest) = buf.split_at(first_limit.min(buf.len()));
    parts.push(head);
    while !rest.is_empty() {
        let take = subsequent_limit.min(rest.len());
        let (chunk, remainder) = rest.split_at(take);
        parts.push(chunk);
        rest = remainder;
    }
    if parts.len() > 255 {
        return Err(CoreError::MalformedFrame("message requires more than 255 parts"));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ping() {
        assert_eq!(parse_inbound(&[0]).unwrap(), InboundFrame::Ping);
    }

    #[test]
    fn parses_handshake() {
        let token = [7u8; flux::TOKEN_SIZE];
        let bytes = encode_inbound_handshake(&token);
        assert_eq!(parse_inbound(&bytes).unwrap(), InboundFrame::Handshake(token));
    }

    #[test]
    fn parses_single_part_ack_and_data() {
        let ack = encode_inbound_ack(5, 0, None, [1, 2]);
        match parse_inbound(&ack).unwrap() {
            InboundFrame::Data { id, content, .. } => {
                assert_eq!(id, 5);
                assert!(content.is_none());
            }
            _ => panic!("expected Data"),
        }

        let data = encode_inbound_data_part(5, 0, None, [1, 2], b"hello");
        match parse_inbound(&data).unwrap() {
            InboundFrame::Data { content, .. } => assert_eq!(content.unwrap(), b"hello"),
            _ => panic!("expected Data"),
        }
    }

    #[test]
    fn first_part_carries_part_count() {
        let frame = encode_inbound_data_part(9, 1, Some(3), [0, 0], b"abc");
        match parse_inbound(&frame).unwrap() {
            InboundFrame::Data { part_num, part_count, .. } => {
                assert_eq!(part_num, 1);
                assert_eq!(part_count, Some(3));
            }
            _ => panic!("expected Data"),
        }
    }

    #[test]
    fn outbound_frames_omit_the_token_prefix() {
        let frame = encode_outbound_data_part(5, 0, None, b"hi");
        assert_eq!(frame, vec![5, 0, b'h', b'i']);
    }

    #[test]
    fn id_sequence_wraps_from_255_to_1() {
        assert_eq!(next_id(254), 255);
        assert_eq!(next_id(255), 1);
    }

    #[test]
    fn precedes_handles_wraparound() {
        assert!(precedes(254, 255));
        assert!(precedes(255, 1));
        assert!(!precedes(1, 255));
    }

    #[test]
    fn small_buffer_is_a_single_part() {
        let limits = ProtocolLimits::default();
        let parts = split_into_parts(b"hello", &limits).unwrap();
        assert_eq!(parts, vec![b"hello".as_slice()]);
    }

    #[test]
    fn large_buffer_splits_with_counted_first_part() {
        let limits = ProtocolLimits::default();
        let buf = vec![0xAB; limits.usable_subsequent_part_bytes() + 10];
        let parts = split_into_parts(&buf, &limits).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), limits.usable_first_part_bytes());
    }

    /// Boundary length from spec §8: `(MAX_SAFE_PACKET_SIZE - 2) * 255 - 1` is the maximum
    /// representable payload (505 + 506*254 = 129029 bytes here), splitting cleanly into 255
    /// parts (1 first + 254 subsequent). One byte more must be rejected.
    #[test]
    fn maximum_representable_length_splits_into_exactly_255_parts() {
        let limits = ProtocolLimits::default();
        let max_len = limits.usable_first_part_bytes() + limits.usable_subsequent_part_bytes() * 254;
        let buf = vec![0xCD; max_len];
        let parts = split_into_parts(&buf, &limits).unwrap();
        assert_eq!(parts.len(), 255);
    }

    #[test]
    fn one_byte_past_the_maximum_is_rejected() {
        let limits = ProtocolLimits::default();
        let max_len = limits.usable_first_part_bytes() + limits.usable_subsequent_part_bytes() * 254;
        let buf = vec![0xCD; max_len + 1];
        assert!(split_into_parts(&buf, &limits).is_err());
    }
}
