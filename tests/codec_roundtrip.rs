//! Black-box round trips through the public `codec` API: encode a frame,
//! decode it back, and confirm the wire-level invariants hold regardless of
//! architecture level, OTMA presence, or segmentation.

use ims_connect_gateway::codec::frame::{decode_frame, encode_frame, FrameDecoder, IrmHeader, OtmaFlags, OtmaHeader};
use ims_connect_gateway::codec::response;
use ims_connect_gateway::codec::segment::{segment_payload, SegmentKind};
use ims_connect_gateway::domain_types::{ArchitectureLevel, ClientId, LtermName, MaxSegmentSize, TxnCode};

fn irm(architecture: u8, input_flags: u8) -> IrmHeader {
    IrmHeader {
        architecture: ArchitectureLevel::try_from(architecture).expect("valid architecture"),
        comm_flags: 0,
        irm_id: "IRMID001".to_string(),
        nak_reason: 0,
        input_flags,
        timeout_byte: 0,
        conn_type: 0,
        encoding: 0,
        client_id: Some(ClientId::try_new("COBOL001").expect("valid client id")),
        user_flags1: 0,
        commit_mode: 0,
        sync_flags: 0,
        msg_type: 0x40,
        txn_code: TxnCode::try_new("ECHO").expect("valid txn code"),
        destination: String::new(),
        lterm: LtermName::try_new("LTERM001").expect("valid lterm"),
        user_id: "USER0001".to_string(),
        group_id: String::new(),
        password: String::new(),
        application_name: "APPLNAME".to_string(),
        reroute_name: String::new(),
        tag_adapter: "TAGADAPT".to_string(),
        tag_map: String::new(),
        mod_name: "MODNAME1".to_string(),
    }
}

fn otma() -> OtmaHeader {
    OtmaHeader {
        version: 1,
        flags: OtmaFlags(0x08),
        conv_id: 0,
        lterm: LtermName::try_new("LTERM001").expect("valid lterm"),
        msg_type: 0,
        sync_level: 0,
        commit_mode: 0,
        response_mode: 0,
    }
}

#[test]
fn every_architecture_level_round_trips_its_user_portion() {
    for level in 0..=5u8 {
        let header = irm(level, 0x01);
        let segments = segment_payload(b"HI", MaxSegmentSize::default(), SegmentKind::Input);
        let encoded = encode_frame(&header, None, &segments);
        let decoded = decode_frame(&encoded).unwrap_or_else(|err| panic!("level {level} failed to decode: {err}"));
        assert_eq!(decoded.irm.architecture, header.architecture);
        if level >= 1 {
            assert_eq!(decoded.irm.application_name, "APPLNAME");
        }
        if level >= 2 {
            assert_eq!(decoded.irm.tag_adapter, "TAGADAPT");
        }
        if level >= 3 {
            assert_eq!(decoded.irm.mod_name, "MODNAME1");
        }
    }
}

#[test]
fn frame_with_otma_header_round_trips() {
    let header = irm(0, 0x00);
    let header_otma = otma();
    let segments = segment_payload(b"CONVERSATION", MaxSegmentSize::default(), SegmentKind::Input);
    let encoded = encode_frame(&header, Some(&header_otma), &segments);
    let decoded = decode_frame(&encoded).expect("decodes");

    let decoded_otma = decoded.otma.expect("OTMA header present");
    assert!(decoded_otma.flags.first());
    assert!(!decoded_otma.flags.last());
    assert_eq!(decoded.segments[0].data.as_ref(), b"CONVERSATION");
}

#[test]
fn frame_without_otma_carries_legacy_trailer() {
    let header = irm(0, 0x01);
    let encoded = encode_frame(&header, None, &[]);
    assert_eq!(&encoded[encoded.len() - 4..], &[0x00, 0x04, 0x00, 0x00]);
    let decoded = decode_frame(&encoded).expect("decodes");
    assert!(decoded.otma.is_none());
    assert!(decoded.segments.is_empty());
}

#[test]
fn oversized_payload_splits_and_reassembles_through_a_full_frame() {
    let header = irm(0, 0x01);
    let payload = vec![0x5Au8; 5000];
    let segments = segment_payload(&payload, MaxSegmentSize::default(), SegmentKind::Input);
    assert!(segments.len() > 1, "payload should have required more than one segment");
    let encoded = encode_frame(&header, None, &segments);
    let decoded = decode_frame(&encoded).expect("decodes");
    let reassembled: Vec<u8> = decoded.segments.iter().flat_map(|s| s.data.iter().copied()).collect();
    assert_eq!(reassembled, payload);
}

#[test]
fn decoder_assembles_a_frame_delivered_across_many_small_reads() {
    let header = irm(0, 0x01);
    let segments = segment_payload(b"FRAGMENTED PAYLOAD", MaxSegmentSize::default(), SegmentKind::Input);
    let encoded = encode_frame(&header, None, &segments);

    let mut decoder = FrameDecoder::new();
    let mut produced = None;
    for chunk in encoded.chunks(3) {
        decoder.feed(chunk);
        if let Some(frame) = decoder.try_decode().expect("no decode error mid-stream") {
            produced = Some(frame);
            break;
        }
    }
    let frame = produced.expect("frame should have completed once all bytes arrived");
    assert_eq!(frame.segments[0].data.as_ref(), b"FRAGMENTED PAYLOAD");
}

#[test]
fn decoder_recovers_a_second_frame_after_the_first_is_consumed() {
    let header = irm(0, 0x01);
    let first = encode_frame(&header, None, &segment_payload(b"ONE", MaxSegmentSize::default(), SegmentKind::Input));
    let second = encode_frame(&header, None, &segment_payload(b"TWO", MaxSegmentSize::default(), SegmentKind::Input));

    let mut decoder = FrameDecoder::new();
    decoder.feed(&first);
    decoder.feed(&second);

    let decoded_first = decoder.try_decode().expect("decodes").expect("first frame complete");
    assert_eq!(decoded_first.segments[0].data.as_ref(), b"ONE");
    let decoded_second = decoder.try_decode().expect("decodes").expect("second frame complete");
    assert_eq!(decoded_second.segments[0].data.as_ref(), b"TWO");
}

#[test]
fn error_response_round_trips_its_return_and_reason_codes() {
    let header = irm(0, 0x01);
    let frame = response::error(&header, None, 408, 1, "transaction timed out");
    let decoded = decode_frame(&frame).expect("decodes");
    let payload = &decoded.segments[0].data[8..];
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 408);
    assert_eq!(u16::from_be_bytes([payload[2], payload[3]]), 1);
}

mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn any_short_payload_survives_an_encode_decode_round_trip(
            payload in proptest::collection::vec(any::<u8>(), 0..4000),
            architecture in 0u8..=5,
        ) {
            let header = irm(architecture, 0x01);
            let segments = segment_payload(&payload, MaxSegmentSize::default(), SegmentKind::Input);
            let encoded = encode_frame(&header, None, &segments);
            let decoded = decode_frame(&encoded).expect("decodes");
            let reassembled: Vec<u8> = decoded.segments.iter().flat_map(|s| s.data.iter().copied()).collect();
            prop_assert_eq!(reassembled, payload);
        }
    }
}
