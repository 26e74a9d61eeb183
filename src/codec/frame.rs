//! IRM header, optional OTMA header, and the frame built from them plus
//! their trailing segments.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::ebcdic::{from_fixed_length, to_fixed_length};
use crate::codec::segment::{decode_segments, Segment};
use crate::domain_types::{ArchitectureLevel, ClientId, LtermName, TxnCode};
use crate::error::ProtocolError;

const MIN_TOTAL_LENGTH: u32 = 36;
const MAX_TOTAL_LENGTH: u32 = 10 * 1024 * 1024;
const IRM_FIXED_LEN: usize = 32;
const OTMA_LEN: usize = 20;
const NO_OTMA_BIT: u8 = 0x01;
const MAINFRAME_FIELD_LEN: usize = 8;

fn user_portion_len(architecture: ArchitectureLevel) -> usize {
    let level: u8 = architecture.into();
    let mut len = 4 + 6 * MAINFRAME_FIELD_LEN; // user flags/commit/sync/msg_type + 6 fields
    if level >= 1 {
        len += 2 * MAINFRAME_FIELD_LEN;
    }
    if level >= 2 {
        len += 2 * MAINFRAME_FIELD_LEN;
    }
    if level >= 3 {
        len += MAINFRAME_FIELD_LEN;
    }
    len
}

fn expected_irm_length(architecture: ArchitectureLevel) -> u16 {
    u16::try_from(28 + user_portion_len(architecture)).expect("bounded by architecture levels 0..=5")
}

/// Fixed IRM header plus its architecture-dependent user portion.
#[derive(Debug, Clone)]
pub struct IrmHeader {
    /// IRM architecture level, 0..=5.
    pub architecture: ArchitectureLevel,
    /// Communication flags byte (`+7`).
    pub comm_flags: u8,
    /// 8-character IRM identifier.
    pub irm_id: String,
    /// NAK reason code, set on retry frames.
    pub nak_reason: u16,
    /// Input message-type flags (`+20`), including the "no-OTMA" bit.
    pub input_flags: u8,
    /// Raw timeout byte (`+21`), interpreted by the timeout manager.
    pub timeout_byte: u8,
    /// Connection type byte (`+22`).
    pub conn_type: u8,
    /// Encoding scheme byte (`+23`).
    pub encoding: u8,
    /// Client id the wire frame carried, if any (may be all pad bytes).
    pub client_id: Option<ClientId>,
    /// User flags 1 (`+32`), including the client-id-request bit.
    pub user_flags1: u8,
    /// Commit mode byte.
    pub commit_mode: u8,
    /// Sync flags byte.
    pub sync_flags: u8,
    /// Message-type byte (`+35`) selecting the dispatcher's routing path.
    pub msg_type: u8,
    /// Transaction code selecting a handler.
    pub txn_code: TxnCode,
    /// Destination name.
    pub destination: String,
    /// Logical terminal name.
    pub lterm: LtermName,
    /// Authenticating user id.
    pub user_id: String,
    /// Authenticating group id.
    pub group_id: String,
    /// Password (or passticket/token material), mainframe-encoded on the wire.
    pub password: String,
    /// Application name (architecture >= 1).
    pub application_name: String,
    /// Reroute name (architecture >= 1).
    pub reroute_name: String,
    /// Tag adapter name (architecture >= 2).
    pub tag_adapter: String,
    /// Tag map name (architecture >= 2).
    pub tag_map: String,
    /// Mod name (architecture >= 3).
    pub mod_name: String,
}

impl IrmHeader {
    /// Bit 0x01 of `input_flags`: whether the OTMA header is absent.
    #[must_use]
    pub fn no_otma(&self) -> bool {
        self.input_flags & NO_OTMA_BIT != 0
    }

    /// Bit 0x02 of `user_flags1`: whether the client requested a generated
    /// client id in the response.
    #[must_use]
    pub fn client_id_requested(&self) -> bool {
        self.user_flags1 & 0x02 != 0
    }
}

/// Bit flags carried in the OTMA header's single flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtmaFlags(pub u8);

impl OtmaFlags {
    /// `hold` bit.
    #[must_use]
    pub fn hold(self) -> bool {
        self.0 & 0x01 != 0
    }
    /// `continue` bit.
    #[must_use]
    pub fn continue_(self) -> bool {
        self.0 & 0x02 != 0
    }
    /// `last` bit: this message ends its conversation.
    #[must_use]
    pub fn last(self) -> bool {
        self.0 & 0x04 != 0
    }
    /// `first` bit: this message starts a new conversation.
    #[must_use]
    pub fn first(self) -> bool {
        self.0 & 0x08 != 0
    }
    /// `ack-required` bit.
    #[must_use]
    pub fn ack_required(self) -> bool {
        self.0 & 0x10 != 0
    }
    /// `sync` bit.
    #[must_use]
    pub fn sync(self) -> bool {
        self.0 & 0x20 != 0
    }
    /// `dequeue` bit.
    #[must_use]
    pub fn dequeue(self) -> bool {
        self.0 & 0x40 != 0
    }
    /// `response` bit.
    #[must_use]
    pub fn response(self) -> bool {
        self.0 & 0x80 != 0
    }
}

/// Optional secondary header present when the IRM's "no-OTMA" flag is clear.
#[derive(Debug, Clone)]
pub struct OtmaHeader {
    /// OTMA header version byte.
    pub version: u8,
    /// OTMA flag bits.
    pub flags: OtmaFlags,
    /// Conversation id; 0 means "not yet assigned, request one."
    pub conv_id: u32,
    /// Logical terminal name for this conversation.
    pub lterm: LtermName,
    /// OTMA message-type byte.
    pub msg_type: u8,
    /// Sync level byte.
    pub sync_level: u8,
    /// Commit mode byte.
    pub commit_mode: u8,
    /// Response mode byte.
    pub response_mode: u8,
}

/// A fully decoded request or response frame.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// The IRM header.
    pub irm: IrmHeader,
    /// The OTMA header, if the IRM's "no-OTMA" flag was clear.
    pub otma: Option<OtmaHeader>,
    /// The frame's data/control segments, in wire order.
    pub segments: Vec<Segment>,
}

fn read_mainframe_field(buf: &mut Bytes) -> String {
    let bytes = buf.copy_to_bytes(MAINFRAME_FIELD_LEN);
    from_fixed_length(&bytes)
}

fn write_mainframe_field(out: &mut BytesMut, text: &str) {
    out.extend_from_slice(&to_fixed_length(text, MAINFRAME_FIELD_LEN, b' '));
}

/// Decodes one complete frame. `bytes` must contain at least the frame's
/// declared `total_length`; any surplus bytes are left unconsumed by the
/// caller (this function only looks at the first `total_length` bytes).
pub fn decode_frame(bytes: &[u8]) -> Result<DecodedFrame, ProtocolError> {
    if bytes.len() < 4 {
        return Err(ProtocolError::Underflow { needed: 4, available: bytes.len() });
    }
    let total_length = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if !(MIN_TOTAL_LENGTH..=MAX_TOTAL_LENGTH).contains(&total_length) {
        return Err(ProtocolError::InvalidLength { length: total_length });
    }
    let total_length = total_length as usize;
    if bytes.len() < total_length {
        return Err(ProtocolError::Underflow { needed: total_length, available: bytes.len() });
    }
    if bytes.len() < IRM_FIXED_LEN {
        return Err(ProtocolError::Underflow { needed: IRM_FIXED_LEN, available: bytes.len() });
    }

    let mut buf = Bytes::copy_from_slice(&bytes[..total_length]);
    buf.advance(4); // total_length already consumed above

    let irm_length = buf.get_u16();
    let architecture_byte = buf.get_u8();
    let architecture = ArchitectureLevel::try_from(architecture_byte)
        .map_err(|_| ProtocolError::UnsupportedArchitecture { level: architecture_byte })?;
    let comm_flags = buf.get_u8();
    let irm_id = {
        let field = buf.copy_to_bytes(MAINFRAME_FIELD_LEN);
        from_fixed_length(&field)
    };
    let nak_reason = buf.get_u16();
    let _reserved = buf.get_u16();
    let input_flags = buf.get_u8();
    let timeout_byte = buf.get_u8();
    let conn_type = buf.get_u8();
    let encoding = buf.get_u8();
    let client_id_text = {
        let field = buf.copy_to_bytes(MAINFRAME_FIELD_LEN);
        from_fixed_length(&field)
    };
    let client_id = ClientId::try_new(client_id_text.clone()).ok();

    if irm_length != expected_irm_length(architecture) {
        return Err(ProtocolError::BadIrm {
            reason: format!(
                "irm_length {irm_length} does not match architecture {architecture} (expected {})",
                expected_irm_length(architecture)
            ),
        });
    }
    let expected_remaining = user_portion_len(architecture) - 4; // already read 4 fixed bytes below
    if buf.remaining() < 4 + expected_remaining {
        return Err(ProtocolError::Underflow {
            needed: 4 + expected_remaining,
            available: buf.remaining(),
        });
    }

    let user_flags1 = buf.get_u8();
    let commit_mode = buf.get_u8();
    let sync_flags = buf.get_u8();
    let msg_type = buf.get_u8();
    let txn_code_text = read_mainframe_field(&mut buf);
    let destination = read_mainframe_field(&mut buf);
    let lterm_text = read_mainframe_field(&mut buf);
    let user_id = read_mainframe_field(&mut buf);
    let group_id = read_mainframe_field(&mut buf);
    let password = read_mainframe_field(&mut buf);

    let level: u8 = architecture.into();
    let application_name = if level >= 1 { read_mainframe_field(&mut buf) } else { String::new() };
    let reroute_name = if level >= 1 { read_mainframe_field(&mut buf) } else { String::new() };
    let tag_adapter = if level >= 2 { read_mainframe_field(&mut buf) } else { String::new() };
    let tag_map = if level >= 2 { read_mainframe_field(&mut buf) } else { String::new() };
    let mod_name = if level >= 3 { read_mainframe_field(&mut buf) } else { String::new() };

    let txn_code = TxnCode::try_new(txn_code_text.clone())
        .map_err(|_| ProtocolError::BadIrm { reason: format!("invalid transaction code {txn_code_text:?}") })?;
    let lterm = LtermName::try_new(lterm_text.clone())
        .map_err(|_| ProtocolError::BadIrm { reason: format!("invalid lterm name {lterm_text:?}") })?;

    let irm = IrmHeader {
        architecture,
        comm_flags,
        irm_id,
        nak_reason,
        input_flags,
        timeout_byte,
        conn_type,
        encoding,
        client_id,
        user_flags1,
        commit_mode,
        sync_flags,
        msg_type,
        txn_code,
        destination,
        lterm,
        user_id,
        group_id,
        password,
        application_name,
        reroute_name,
        tag_adapter,
        tag_map,
        mod_name,
    };

    let otma = if irm.no_otma() {
        None
    } else {
        if buf.remaining() < OTMA_LEN {
            return Err(ProtocolError::Underflow { needed: OTMA_LEN, available: buf.remaining() });
        }
        let _length = buf.get_u16();
        let version = buf.get_u8();
        let flags = OtmaFlags(buf.get_u8());
        let conv_id = buf.get_u32();
        let lterm_text = read_mainframe_field(&mut buf);
        let otma_lterm = LtermName::try_new(lterm_text.clone())
            .map_err(|_| ProtocolError::BadIrm { reason: format!("invalid OTMA lterm {lterm_text:?}") })?;
        let msg_type = buf.get_u8();
        let sync_level = buf.get_u8();
        let commit_mode = buf.get_u8();
        let response_mode = buf.get_u8();
        Some(OtmaHeader {
            version,
            flags,
            conv_id,
            lterm: otma_lterm,
            msg_type,
            sync_level,
            commit_mode,
            response_mode,
        })
    };

    let segments = decode_segments(&mut buf)?;

    Ok(DecodedFrame { irm, otma, segments })
}

/// Serializes a frame, writing the final `total_length` prefix after every
/// other field is known. Appends the legacy `00 04 00 00` trailer only when
/// `otma` is absent, per the response builder's encode contract.
#[must_use]
pub fn encode_frame(irm: &IrmHeader, otma: Option<&OtmaHeader>, segments: &[Segment]) -> BytesMut {
    let mut out = BytesMut::with_capacity(256);
    out.put_u32(0); // placeholder, patched below
    out.put_u16(expected_irm_length(irm.architecture));
    out.put_u8(irm.architecture.into());
    out.put_u8(irm.comm_flags);
    write_mainframe_field(&mut out, &irm.irm_id);
    out.put_u16(irm.nak_reason);
    out.put_u16(0); // reserved
    out.put_u8(irm.input_flags);
    out.put_u8(irm.timeout_byte);
    out.put_u8(irm.conn_type);
    out.put_u8(irm.encoding);
    write_mainframe_field(&mut out, irm.client_id.as_ref().map_or("", ClientId::as_ref));

    out.put_u8(irm.user_flags1);
    out.put_u8(irm.commit_mode);
    out.put_u8(irm.sync_flags);
    out.put_u8(irm.msg_type);
    write_mainframe_field(&mut out, irm.txn_code.as_ref());
    write_mainframe_field(&mut out, &irm.destination);
    write_mainframe_field(&mut out, irm.lterm.as_ref());
    write_mainframe_field(&mut out, &irm.user_id);
    write_mainframe_field(&mut out, &irm.group_id);
    write_mainframe_field(&mut out, &irm.password);

    let level: u8 = irm.architecture.into();
    if level >= 1 {
        write_mainframe_field(&mut out, &irm.application_name);
        write_mainframe_field(&mut out, &irm.reroute_name);
    }
    if level >= 2 {
        write_mainframe_field(&mut out, &irm.tag_adapter);
        write_mainframe_field(&mut out, &irm.tag_map);
    }
    if level >= 3 {
        write_mainframe_field(&mut out, &irm.mod_name);
    }

    if let Some(otma) = otma {
        out.put_u16(u16::try_from(OTMA_LEN).expect("OTMA_LEN fits u16"));
        out.put_u8(otma.version);
        out.put_u8(otma.flags.0);
        out.put_u32(otma.conv_id);
        write_mainframe_field(&mut out, otma.lterm.as_ref());
        out.put_u8(otma.msg_type);
        out.put_u8(otma.sync_level);
        out.put_u8(otma.commit_mode);
        out.put_u8(otma.response_mode);
    }

    for segment in segments {
        out.extend_from_slice(&segment.encode());
    }
    if otma.is_none() {
        out.extend_from_slice(&[0x00, 0x04, 0x00, 0x00]);
    }

    let total_length = u32::try_from(out.len()).expect("frames are bounded by MAX_TOTAL_LENGTH");
    out[0..4].copy_from_slice(&total_length.to_be_bytes());
    out
}

/// Owns a growable read buffer and implements "peek-length, wait-for-complete,
/// slice, hand off": it never consumes bytes on a partial frame.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends newly-read bytes to the internal buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Attempts to decode one complete frame from the buffered bytes.
    /// Returns `Ok(None)` if fewer bytes than the declared `total_length`
    /// have arrived yet; does not consume any bytes in that case.
    pub fn try_decode(&mut self) -> Result<Option<DecodedFrame>, ProtocolError> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let total_length = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]);
        if !(MIN_TOTAL_LENGTH..=MAX_TOTAL_LENGTH).contains(&total_length) {
            return Err(ProtocolError::InvalidLength { length: total_length });
        }
        let total_length = total_length as usize;
        if self.buffer.len() < total_length {
            return Ok(None);
        }
        let frame_bytes = self.buffer.split_to(total_length);
        decode_frame(&frame_bytes).map(Some)
    }
}
