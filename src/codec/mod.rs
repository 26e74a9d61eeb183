//! Protocol framing and codec: EBCDIC conversion (C1), the IRM/OTMA/segment
//! wire format (C2), and response assembly (C3).

pub mod ebcdic;
pub mod frame;
pub mod response;
pub mod segment;
