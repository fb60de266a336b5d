//! kurier-protocol – Envelope-Layout und Transport-Frames
//!
//! Dieses Crate definiert das binaer-exakte Envelope-Format, die
//! Steuerungs-Frames zwischen Client und Relay und den Frame-Codec fuer
//! `tokio_util::codec::Framed`.

pub mod control;
pub mod envelope;
pub mod error;
pub mod wire;

pub use control::{
    ClientFrame, ControlEvent, DeliveryFailure, DeliveryReceipt, ErrorCode, FailedDelivery,
    LeaveReason, ServerFrame,
};
pub use envelope::{Envelope, EnvelopeHeader, SealedPayload, NONCE_LAENGE, TAG_LAENGE};
pub use error::{WireError, WireResult};
pub use wire::{ClientCodec, FrameCodec, ServerCodec};
