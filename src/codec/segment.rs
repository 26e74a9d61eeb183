//! LL/ZZ segment framing: a 2-byte length (covering the 4-byte prefix plus
//! data), a 2-byte control/type word, then the data bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::domain_types::MaxSegmentSize;
use crate::error::ProtocolError;

/// Position of a segment within its reassembly sequence, carried in the
/// control word's high 2 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentPosition {
    /// First of a multi-segment sequence.
    First,
    /// Interior segment of a multi-segment sequence.
    Middle,
    /// Final segment of a multi-segment sequence.
    Last,
    /// The sole segment of a single-segment message.
    Only,
}

impl SegmentPosition {
    fn from_bits(bits: u16) -> Self {
        match bits {
            0b00 => SegmentPosition::First,
            0b01 => SegmentPosition::Middle,
            0b10 => SegmentPosition::Last,
            _ => SegmentPosition::Only,
        }
    }

    fn to_bits(self) -> u16 {
        match self {
            SegmentPosition::First => 0b00,
            SegmentPosition::Middle => 0b01,
            SegmentPosition::Last => 0b10,
            SegmentPosition::Only => 0b11,
        }
    }

    /// Whether this segment ends a reassembly sequence (no more follow on).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, SegmentPosition::Last | SegmentPosition::Only)
    }
}

/// Segment type carried in the control word's low 14 bits, when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Input data segment.
    Input,
    /// Output data segment.
    Output,
    /// Scratch-pad area segment.
    ScratchPad,
    /// Status segment.
    Status,
    /// A type code this codec does not assign meaning to; preserved as-is.
    Unknown(u16),
}

impl SegmentKind {
    fn from_bits(bits: u16) -> Self {
        match bits {
            0 => SegmentKind::Input,
            1 => SegmentKind::Output,
            2 => SegmentKind::ScratchPad,
            3 => SegmentKind::Status,
            other => SegmentKind::Unknown(other),
        }
    }

    fn to_bits(self) -> u16 {
        match self {
            SegmentKind::Input => 0,
            SegmentKind::Output => 1,
            SegmentKind::ScratchPad => 2,
            SegmentKind::Status => 3,
            SegmentKind::Unknown(bits) => bits,
        }
    }
}

const POSITION_SHIFT: u16 = 14;
const KIND_MASK: u16 = 0x3FFF;

/// One LL/ZZ-framed segment: a position, an optional type, and the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Where this segment falls in its reassembly sequence.
    pub position: SegmentPosition,
    /// The segment's declared type.
    pub kind: SegmentKind,
    /// The segment's payload bytes (length `LL - 4`).
    pub data: Bytes,
}

impl Segment {
    fn control_word(&self) -> u16 {
        (self.position.to_bits() << POSITION_SHIFT) | (self.kind.to_bits() & KIND_MASK)
    }

    /// Encodes this segment as `LL | ZZ | data`.
    #[must_use]
    pub fn encode(&self) -> BytesMut {
        let ll = u16::try_from(4 + self.data.len()).expect("segment data bounded by MaxSegmentSize");
        let mut out = BytesMut::with_capacity(self.data.len() + 4);
        out.put_u16(ll);
        out.put_u16(self.control_word());
        out.extend_from_slice(&self.data);
        out
    }
}

/// Decodes every segment from `buf` until a terminal segment (Last/Only) or
/// the legacy 4-byte trailer (`00 04 00 00`) is consumed. Leaves any bytes
/// after the terminating marker untouched.
pub fn decode_segments(buf: &mut Bytes) -> Result<Vec<Segment>, ProtocolError> {
    let mut segments = Vec::new();
    loop {
        if buf.remaining() < 4 {
            return Err(ProtocolError::Underflow { needed: 4, available: buf.remaining() });
        }
        let mut peek = buf.clone();
        let ll = peek.get_u16();
        let control = peek.get_u16();

        if !(4..=32768).contains(&ll) {
            return Err(ProtocolError::BadSegmentLength { length: ll });
        }
        let data_len = usize::from(ll - 4);
        if buf.remaining() < 4 + data_len {
            return Err(ProtocolError::Underflow { needed: 4 + data_len, available: buf.remaining() });
        }

        buf.advance(4);
        let data = buf.copy_to_bytes(data_len);

        if ll == 4 && control == 0 {
            // Legacy end-of-message trailer; stop without recording a segment.
            break;
        }

        let position = SegmentPosition::from_bits(control >> POSITION_SHIFT);
        let kind = SegmentKind::from_bits(control & KIND_MASK);
        let terminal = position.is_terminal();
        segments.push(Segment { position, kind, data });
        if terminal {
            break;
        }
    }
    Ok(segments)
}

/// Splits `payload` into one or more segments per the segmentation
/// algorithm: a single `Only` segment if it fits within `max - 4` bytes,
/// otherwise a `First`, zero or more `Middle`, and one `Last` segment.
#[must_use]
pub fn segment_payload(payload: &[u8], max: MaxSegmentSize, kind: SegmentKind) -> Vec<Segment> {
    let chunk_size = usize::from(max) - 4;
    if payload.len() <= chunk_size {
        return vec![Segment { position: SegmentPosition::Only, kind, data: Bytes::copy_from_slice(payload) }];
    }

    let mut segments = Vec::new();
    let mut chunks = payload.chunks(chunk_size).peekable();
    let mut first = true;
    while let Some(chunk) = chunks.next() {
        let position = if first {
            SegmentPosition::First
        } else if chunks.peek().is_none() {
            SegmentPosition::Last
        } else {
            SegmentPosition::Middle
        };
        segments.push(Segment { position, kind, data: Bytes::copy_from_slice(chunk) });
        first = false;
    }
    segments
}

/// Concatenates segment payloads in receive order, reversing
/// [`segment_payload`].
#[must_use]
pub fn reassemble(segments: &[Segment]) -> Vec<u8> {
    segments.iter().flat_map(|s| s.data.iter().copied()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_short_segment_should_encode_as_only() {
        let segments = segment_payload(b"HELLO", MaxSegmentSize::default(), SegmentKind::Input);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].position, SegmentPosition::Only);
    }

    #[test]
    fn oversized_payload_should_split_first_middle_last() {
        let max = MaxSegmentSize::try_new(8).expect("8 is valid");
        let payload = vec![0xAAu8; 10];
        let segments = segment_payload(&payload, max, SegmentKind::Input);
        assert_eq!(segments[0].position, SegmentPosition::First);
        assert_eq!(segments.last().expect("non-empty").position, SegmentPosition::Last);
        assert_eq!(reassemble(&segments), payload);
    }

    #[test]
    fn decode_encode_round_trips() {
        let original = segment_payload(b"PING", MaxSegmentSize::default(), SegmentKind::Input);
        let mut buf = BytesMut::new();
        for segment in &original {
            buf.extend_from_slice(&segment.encode());
        }
        let mut bytes = buf.freeze();
        let decoded = decode_segments(&mut bytes).expect("decodes");
        assert_eq!(decoded, original);
    }

    #[test]
    fn trailer_should_terminate_without_producing_a_segment() {
        let mut bytes = Bytes::from_static(&[0x00, 0x04, 0x00, 0x00]);
        let decoded = decode_segments(&mut bytes).expect("decodes");
        assert!(decoded.is_empty());
        assert!(bytes.is_empty());
    }

    #[test]
    fn bad_segment_length_should_be_rejected() {
        let mut bytes = Bytes::from_static(&[0x00, 0x02, 0x00, 0x00]);
        assert!(matches!(decode_segments(&mut bytes), Err(ProtocolError::BadSegmentLength { length: 2 })));
    }

    proptest::proptest! {
        #[test]
        fn any_payload_up_to_64k_reassembles(payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..65536)) {
            let segments = segment_payload(&payload, MaxSegmentSize::default(), SegmentKind::Input);
            proptest::prop_assert_eq!(reassemble(&segments), payload);
            for segment in &segments {
                let ll = 4 + segment.data.len();
                proptest::prop_assert!((4..=32768).contains(&ll));
            }
        }
    }
}
