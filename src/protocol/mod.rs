//! Sensor wire protocol: framing, packet decoding and register commands.

pub mod command;
pub mod decoder;
pub mod frame;
pub mod packet;

pub use decoder::{decode_frame, DecoderStats, FrameDecoder, RejectReason};
pub use frame::{RawFrame, FRAME_LEN};
pub use packet::{encode_acceleration, Acceleration, DecodedPacket, PacketKind};
