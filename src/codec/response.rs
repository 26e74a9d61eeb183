//! Assembly of the five response kinds: success (with optional data), error,
//! ACK, NAK, and the bare trailer. Each constructor writes the CSM/RSM
//! control segment first, then CID/RMM as applicable, then any data
//! segments, and defers the 4-byte total-length prefix to
//! [`encode_frame`](crate::codec::frame::encode_frame) which always writes
//! it last.

use bytes::Bytes;

use crate::codec::ebcdic::to_fixed_length;
use crate::codec::frame::{encode_frame, IrmHeader, OtmaHeader};
use crate::codec::segment::{segment_payload, Segment, SegmentKind, SegmentPosition};
use crate::domain_types::{ClientId, MaxSegmentSize};

const CSM_TAG: &str = "*CSMOKY*";
const RSM_TAG: &str = "*REQSTS*";
const CID_TAG: &str = "*GENCID*";
const RMM_TAG: &str = "*REQMOD*";
const ERROR_MESSAGE_LEN: usize = 80;

fn tagged(tag: &str, payload: &[u8]) -> Bytes {
    let mut bytes = to_fixed_length(tag, 8, b' ');
    bytes.extend_from_slice(payload);
    Bytes::from(bytes)
}

fn assemble(chunks: Vec<(SegmentKind, Bytes)>) -> Vec<Segment> {
    let n = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, (kind, data))| {
            let position = if n == 1 {
                SegmentPosition::Only
            } else if i == 0 {
                SegmentPosition::First
            } else if i == n - 1 {
                SegmentPosition::Last
            } else {
                SegmentPosition::Middle
            };
            Segment { position, kind, data }
        })
        .collect()
}

/// Parameters shared by every "successful" response kind: the request's IRM
/// (echoed back, with fields the dispatcher adjusts first), the OTMA header
/// to carry forward, and optional generated client id / mod name segments.
#[derive(Debug, Clone, Default)]
pub struct ResponseParams {
    /// Generated client id, placed in a `*GENCID*` segment immediately
    /// after CSM, before any data.
    pub generated_client_id: Option<ClientId>,
    /// Mod name, placed in a `*REQMOD*` segment between CSM and data.
    pub mod_name: Option<String>,
    /// Response data payload segments, in order, each pre-split if it
    /// exceeds `max_segment_size`.
    pub data: Vec<Vec<u8>>,
}

/// Builds a success response: CSM, then optional CID, then optional RMM,
/// then data segments.
#[must_use]
pub fn success(
    request_irm: &IrmHeader,
    otma: Option<&OtmaHeader>,
    params: &ResponseParams,
    max_segment_size: MaxSegmentSize,
) -> Vec<u8> {
    let mut chunks = vec![(SegmentKind::Status, tagged(CSM_TAG, &[]))];
    if let Some(client_id) = &params.generated_client_id {
        chunks.push((SegmentKind::Status, tagged(CID_TAG, to_fixed_length(client_id.as_ref(), 8, b' ').as_ref())));
    }
    if let Some(mod_name) = &params.mod_name {
        chunks.push((SegmentKind::Status, tagged(RMM_TAG, to_fixed_length(mod_name, 8, b' ').as_ref())));
    }
    for data in &params.data {
        for segment in segment_payload(data, max_segment_size, SegmentKind::Output) {
            chunks.push((SegmentKind::Output, segment.data));
        }
    }
    let segments = assemble(chunks);
    encode_frame(request_irm, otma, &segments).to_vec()
}

/// Builds an error response: a single RSM segment carrying the return code,
/// reason code, and an 80-byte human-readable message.
#[must_use]
pub fn error(
    request_irm: &IrmHeader,
    otma: Option<&OtmaHeader>,
    return_code: u16,
    reason_code: u16,
    message: &str,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + ERROR_MESSAGE_LEN);
    payload.extend_from_slice(&return_code.to_be_bytes());
    payload.extend_from_slice(&reason_code.to_be_bytes());
    payload.extend_from_slice(&to_fixed_length(message, ERROR_MESSAGE_LEN, b' '));
    let segments = assemble(vec![(SegmentKind::Status, tagged(RSM_TAG, &payload))]);
    encode_frame(request_irm, otma, &segments).to_vec()
}

/// Builds an immediate ACK for a SEND_ONLY request, optionally carrying a
/// generated client id.
#[must_use]
pub fn ack(request_irm: &IrmHeader, otma: Option<&OtmaHeader>, generated_client_id: Option<&ClientId>) -> Vec<u8> {
    let params = ResponseParams { generated_client_id: generated_client_id.cloned(), ..Default::default() };
    success(request_irm, otma, &params, MaxSegmentSize::default())
}

/// Builds a NAK response carrying the rejection reason.
#[must_use]
pub fn nak(request_irm: &IrmHeader, otma: Option<&OtmaHeader>, reason_code: u16, message: &str) -> Vec<u8> {
    error(request_irm, otma, 4, reason_code, message)
}

/// Builds an empty-success frame consisting of just the bare trailer (used
/// by RECV_ONLY when no message is queued).
#[must_use]
pub fn empty_trailer(request_irm: &IrmHeader) -> Vec<u8> {
    encode_frame(request_irm, None, &[]).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::frame::decode_frame;
    use crate::domain_types::{ArchitectureLevel, LtermName, TxnCode};

    fn sample_irm() -> IrmHeader {
        IrmHeader {
            architecture: ArchitectureLevel::try_from(0).expect("valid"),
            comm_flags: 0,
            irm_id: "IRMID001".to_string(),
            nak_reason: 0,
            input_flags: 0x01,
            timeout_byte: 0,
            conn_type: 0,
            encoding: 0,
            client_id: None,
            user_flags1: 0,
            commit_mode: 0,
            sync_flags: 0,
            msg_type: 0x40,
            txn_code: TxnCode::try_new("ECHO").expect("valid"),
            destination: String::new(),
            lterm: LtermName::try_new("LTERM001").expect("valid"),
            user_id: String::new(),
            group_id: String::new(),
            password: String::new(),
            application_name: String::new(),
            reroute_name: String::new(),
            tag_adapter: String::new(),
            tag_map: String::new(),
            mod_name: String::new(),
        }
    }

    #[test]
    fn success_with_data_should_decode_with_csm_then_data() {
        let irm = sample_irm();
        let params = ResponseParams { data: vec![b"ECHO: HELLO".to_vec()], ..Default::default() };
        let frame = success(&irm, None, &params, MaxSegmentSize::default());
        let decoded = decode_frame(&frame).expect("decodes");
        assert_eq!(decoded.segments.len(), 2);
        assert!(decoded.segments[0].data.starts_with(&to_fixed_length(CSM_TAG, 8, b' ')));
        assert_eq!(decoded.segments[1].data.as_ref(), b"ECHO: HELLO");
    }

    #[test]
    fn success_with_generated_client_id_places_cid_before_data() {
        let irm = sample_irm();
        let client_id = ClientId::try_new("COBOL001").expect("valid");
        let params = ResponseParams {
            generated_client_id: Some(client_id.clone()),
            data: vec![b"hi".to_vec()],
            ..Default::default()
        };
        let frame = success(&irm, None, &params, MaxSegmentSize::default());
        let decoded = decode_frame(&frame).expect("decodes");
        assert_eq!(decoded.segments.len(), 3);
        assert!(decoded.segments[1].data.starts_with(&to_fixed_length(CID_TAG, 8, b' ')));
    }

    #[test]
    fn error_response_should_carry_return_and_reason_codes() {
        let irm = sample_irm();
        let frame = error(&irm, None, 408, 1, "transaction timed out");
        let decoded = decode_frame(&frame).expect("decodes");
        assert_eq!(decoded.segments.len(), 1);
        let payload = &decoded.segments[0].data[8..];
        assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 408);
        assert_eq!(u16::from_be_bytes([payload[2], payload[3]]), 1);
    }

    #[test]
    fn empty_trailer_should_decode_with_no_segments() {
        let irm = sample_irm();
        let frame = empty_trailer(&irm);
        let decoded = decode_frame(&frame).expect("decodes");
        assert!(decoded.segments.is_empty());
    }
}
