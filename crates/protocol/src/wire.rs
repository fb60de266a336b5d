//! Framing zwischen Client und Relay
//!
//! Jeder Frame ist ein JSON-Dokument mit vorangestellter u32-Laenge (big-endian).
//!
//! ## Frame-Format
//!
//! ```text
//! [ laenge: u32 BE ][ json: laenge Bytes ]
//! ```
//!
//! Die Laenge zaehlt nur das JSON. Frames ueber dem Limit (Standard 1 MiB)
//! werden in beide Richtungen abgewiesen.

use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use std::io;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

use crate::control::{ClientFrame, ServerFrame};

// ---------------------------------------------------------------------------
// Konstanten
// ---------------------------------------------------------------------------

/// Frame-Limit, falls nichts konfiguriert ist
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Laengenpraefix vor jedem Frame
pub const LENGTH_FIELD_SIZE: usize = 4;

// ---------------------------------------------------------------------------
// FrameCodec
// ---------------------------------------------------------------------------

/// Laengenpraefix-Codec fuer typisierte JSON-Frames
///
/// `In` ist der dekodierte Frame-Typ, `Out` der kodierte. Der Relay
/// verwendet [`ServerCodec`], Clients [`ClientCodec`].
pub struct FrameCodec<In, Out> {
    max_frame_size: usize,
    _frames: PhantomData<fn(Out) -> In>,
}

/// Codec auf Relay-Seite: liest `ClientFrame`, schreibt `ServerFrame`
pub type ServerCodec = FrameCodec<ClientFrame, ServerFrame>;

/// Codec auf Client-Seite: liest `ServerFrame`, schreibt `ClientFrame`
pub type ClientCodec = FrameCodec<ServerFrame, ClientFrame>;

impl<In, Out> FrameCodec<In, Out> {
    /// Codec mit [`DEFAULT_MAX_FRAME_SIZE`]
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            _frames: PhantomData,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl<In, Out> Default for FrameCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In, Out> std::fmt::Debug for FrameCodec<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Dekodieren
// ---------------------------------------------------------------------------

impl<In: DeserializeOwned, Out> Decoder for FrameCodec<In, Out> {
    type Item = In;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }

        // Laenge lesen ohne den Buffer zu veraendern
        let mut praefix = [0u8; LENGTH_FIELD_SIZE];
        praefix.copy_from_slice(&src[..LENGTH_FIELD_SIZE]);
        let laenge = u32::from_be_bytes(praefix) as usize;

        if laenge > self.max_frame_size {
            return Err(ungueltig(format!(
                "eingehender Frame ueberschreitet Limit ({laenge} > {})",
                self.max_frame_size
            )));
        }

        let gesamt = LENGTH_FIELD_SIZE + laenge;
        if src.len() < gesamt {
            src.reserve(gesamt - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_SIZE);
        let json = src.split_to(laenge);
        let frame = serde_json::from_slice(&json)
            .map_err(|e| ungueltig(format!("Frame ist kein gueltiges JSON: {e}")))?;

        Ok(Some(frame))
    }
}

fn ungueltig(nachricht: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, nachricht)
}

// ---------------------------------------------------------------------------
// Kodieren
// ---------------------------------------------------------------------------

impl<In, Out: Serialize> Encoder<Out> for FrameCodec<In, Out> {
    type Error = io::Error;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)
            .map_err(|e| ungueltig(format!("Frame nicht serialisierbar: {e}")))?;

        if json.len() > self.max_frame_size {
            return Err(ungueltig(format!(
                "ausgehender Frame ueberschreitet Limit ({} > {})",
                json.len(),
                self.max_frame_size
            )));
        }

        let laenge = u32::try_from(json.len())
            .map_err(|_| ungueltig("Frame-Laenge passt nicht in u32".into()))?;
        dst.reserve(LENGTH_FIELD_SIZE + json.len());
        dst.put_u32(laenge);
        dst.extend_from_slice(&json);

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use kurier_core::types::RoomId;

    fn join_frame(name: &str) -> ClientFrame {
        ClientFrame::Join {
            room_id: RoomId::from(name),
        }
    }

    #[test]
    fn client_zu_server_round_trip() {
        let mut client = ClientCodec::new();
        let mut server = ServerCodec::new();

        let mut buf = BytesMut::with_capacity(64);
        client.encode(join_frame("general"), &mut buf).unwrap();

        let json_laenge = (&buf[..LENGTH_FIELD_SIZE]).get_u32() as usize;
        assert_eq!(buf.len(), LENGTH_FIELD_SIZE + json_laenge);

        let decoded = server
            .decode(&mut buf)
            .unwrap()
            .expect("Muss einen Frame enthalten");
        assert_eq!(decoded, join_frame("general"));
    }

    #[test]
    fn unvollstaendiger_frame_wartet() {
        let mut client = ClientCodec::new();
        let mut server = ServerCodec::new();

        let mut buf = BytesMut::with_capacity(64);
        client.encode(join_frame("x"), &mut buf).unwrap();

        let mut erste_haelfte = buf.split_to(buf.len() / 2);
        assert!(server.decode(&mut erste_haelfte).unwrap().is_none());
    }

    #[test]
    fn zu_grosser_frame_wird_abgelehnt() {
        let mut server = ServerCodec::with_max_size(100);

        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32(200);
        buf.extend_from_slice(&[b' '; 200]);

        assert!(server.decode(&mut buf).is_err());
    }

    #[test]
    fn zu_grosse_nachricht_beim_encode() {
        let mut client = ClientCodec::with_max_size(10);
        let mut buf = BytesMut::with_capacity(64);
        assert!(client.encode(join_frame("general"), &mut buf).is_err());
    }

    #[test]
    fn mehrere_frames_im_buffer() {
        let mut client = ClientCodec::new();
        let mut server = ServerCodec::new();
        let mut buf = BytesMut::with_capacity(64);

        for name in ["a", "b", "c"] {
            client.encode(join_frame(name), &mut buf).unwrap();
        }
        for name in ["a", "b", "c"] {
            let frame = server.decode(&mut buf).unwrap().expect("Frame erwartet");
            assert_eq!(frame, join_frame(name));
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn ungueltiges_json_ist_invalid_data() {
        let mut server = ServerCodec::new();
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32(3);
        buf.put_slice(b"{{{");

        let err = server.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
