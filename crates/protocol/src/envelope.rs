//! Envelope – die verschluesselte Nachrichteneinheit auf dem Draht
//!
//! Ein Envelope enthaelt den mit RSA-OAEP eingewickelten Einmal-Schluessel,
//! Nonce, Ciphertext und Auth-Tag von AES-256-GCM sowie die
//! Routing-Metadaten. Der Relay sieht nur diese Struktur, nie Klartext.
//!
//! ## Format (big-endian)
//! ```text
//! [magic "KRE1"(4)] [version(1)] [flags(1)]
//! [sender_id(16)] [receiver_id(16)] [timestamp_ms(8)]
//! [wrapped_key_len(2)] [wrapped_key]
//! [nonce(12)] [auth_tag(16)]
//! [ciphertext_len(4)] [ciphertext]
//! ```
//!
//! ## AAD (nur bei gesetztem Flag-Bit 0)
//! ```text
//! [sender_id(16)] [receiver_id(16)] [timestamp_ms(8)]
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Buf, BufMut};
use chrono::{DateTime, Utc};
use kurier_core::types::IdentityId;

use crate::error::{WireError, WireResult};

// ---------------------------------------------------------------------------
// Konstanten
// ---------------------------------------------------------------------------

/// AES-GCM Nonce-Laenge (96 Bit)
pub const NONCE_LAENGE: usize = 12;

/// AES-GCM Auth-Tag-Laenge (128 Bit)
pub const TAG_LAENGE: usize = 16;

/// Magic-Bytes am Anfang jedes Envelopes
pub const MAGIC: [u8; 4] = *b"KRE1";

/// Aktuelle Format-Version
pub const VERSION: u8 = 1;

/// Flag-Bit: Metadaten sind als AAD an den Ciphertext gebunden
pub const FLAG_METADATEN_GEBUNDEN: u8 = 0b0000_0001;

/// Laenge der AAD (sender + receiver + timestamp)
pub const AAD_LAENGE: usize = 16 + 16 + 8;

/// Feste Bytes ohne wrapped_key und ciphertext
const FESTE_LAENGE: usize = 4 + 1 + 1 + 16 + 16 + 8 + 2 + NONCE_LAENGE + TAG_LAENGE + 4;

// ---------------------------------------------------------------------------
// EnvelopeHeader
// ---------------------------------------------------------------------------

/// Routing-Metadaten eines Envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub sender_id: IdentityId,
    pub receiver_id: IdentityId,
    /// Unix-Zeit in Millisekunden
    pub timestamp_ms: i64,
}

impl EnvelopeHeader {
    /// Erstellt einen Header mit dem aktuellen Zeitpunkt
    pub fn neu(sender_id: IdentityId, receiver_id: IdentityId) -> Self {
        Self {
            sender_id,
            receiver_id,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    /// AAD-Bytes fuer die Bindung der Metadaten an den Ciphertext
    pub fn aad(&self) -> [u8; AAD_LAENGE] {
        let mut aad = [0u8; AAD_LAENGE];
        aad[0..16].copy_from_slice(self.sender_id.as_bytes());
        aad[16..32].copy_from_slice(self.receiver_id.as_bytes());
        aad[32..40].copy_from_slice(&self.timestamp_ms.to_be_bytes());
        aad
    }
}

// ---------------------------------------------------------------------------
// SealedPayload
// ---------------------------------------------------------------------------

/// Ergebnis der hybriden Verschluesselung ohne Routing-Metadaten
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    pub wrapped_key: Vec<u8>,
    pub nonce: [u8; NONCE_LAENGE],
    pub ciphertext: Vec<u8>,
    pub auth_tag: [u8; TAG_LAENGE],
}

impl SealedPayload {
    /// Versieht den Payload mit Absender, Empfaenger und Zeitstempel
    ///
    /// Die Metadaten sind dabei nicht kryptografisch gebunden.
    pub fn address(self, header: EnvelopeHeader) -> Envelope {
        Envelope {
            sender_id: header.sender_id,
            receiver_id: header.receiver_id,
            timestamp_ms: header.timestamp_ms,
            metadata_bound: false,
            wrapped_key: self.wrapped_key,
            nonce: self.nonce,
            ciphertext: self.ciphertext,
            auth_tag: self.auth_tag,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Verschluesselte Nachricht mit Routing-Metadaten
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender_id: IdentityId,
    pub receiver_id: IdentityId,
    /// Unix-Zeit in Millisekunden
    pub timestamp_ms: i64,
    /// Sind sender/receiver/timestamp als AAD gebunden?
    pub metadata_bound: bool,
    /// Symmetrischer Schluessel, RSA-OAEP-verschluesselt fuer den Empfaenger
    pub wrapped_key: Vec<u8>,
    pub nonce: [u8; NONCE_LAENGE],
    pub ciphertext: Vec<u8>,
    pub auth_tag: [u8; TAG_LAENGE],
}

impl Envelope {
    /// Gibt die Routing-Metadaten zurueck
    pub fn header(&self) -> EnvelopeHeader {
        EnvelopeHeader {
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            timestamp_ms: self.timestamp_ms,
        }
    }

    /// AAD fuer die Entschluesselung (leer wenn nicht gebunden)
    pub fn aad(&self) -> Option<[u8; AAD_LAENGE]> {
        self.metadata_bound.then(|| self.header().aad())
    }

    /// Zeitstempel als `DateTime<Utc>`
    pub fn zeitpunkt(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp_ms)
    }

    /// Serialisiert in das binaere Wire-Format
    pub fn to_bytes(&self) -> WireResult<Vec<u8>> {
        let wrapped_len = u16::try_from(self.wrapped_key.len())
            .map_err(|_| WireError::WrappedKeyZuLang(self.wrapped_key.len()))?;
        let ciphertext_len = u32::try_from(self.ciphertext.len())
            .map_err(|_| WireError::CiphertextZuLang(self.ciphertext.len()))?;

        let flags = if self.metadata_bound {
            FLAG_METADATEN_GEBUNDEN
        } else {
            0
        };

        let mut out =
            Vec::with_capacity(FESTE_LAENGE + self.wrapped_key.len() + self.ciphertext.len());
        out.put_slice(&MAGIC);
        out.put_u8(VERSION);
        out.put_u8(flags);
        out.put_slice(self.sender_id.as_bytes());
        out.put_slice(self.receiver_id.as_bytes());
        out.put_i64(self.timestamp_ms);
        out.put_u16(wrapped_len);
        out.put_slice(&self.wrapped_key);
        out.put_slice(&self.nonce);
        out.put_slice(&self.auth_tag);
        out.put_u32(ciphertext_len);
        out.put_slice(&self.ciphertext);
        Ok(out)
    }

    /// Deserialisiert aus dem binaeren Wire-Format
    ///
    /// Lehnt falsche Magic, unbekannte Versionen/Flags, abgeschnittene
    /// Eingaben und ueberzaehlige Bytes ab.
    pub fn from_bytes(bytes: &[u8]) -> WireResult<Self> {
        if bytes.len() < FESTE_LAENGE {
            return Err(WireError::ZuKurz {
                erwartet: FESTE_LAENGE,
                erhalten: bytes.len(),
            });
        }

        let mut buf = bytes;
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(WireError::FalscheMagic);
        }

        let version = buf.get_u8();
        if version != VERSION {
            return Err(WireError::UnbekannteVersion(version));
        }

        let flags = buf.get_u8();
        if flags & !FLAG_METADATEN_GEBUNDEN != 0 {
            return Err(WireError::UnbekannteFlags(flags));
        }

        let sender_id = IdentityId::from_bytes(lese_array(&mut buf));
        let receiver_id = IdentityId::from_bytes(lese_array(&mut buf));
        let timestamp_ms = buf.get_i64();

        let wrapped_len = buf.get_u16() as usize;
        // Restliche feste Felder: nonce + tag + ciphertext_len
        let noch_fest = NONCE_LAENGE + TAG_LAENGE + 4;
        if buf.remaining() < wrapped_len + noch_fest {
            return Err(WireError::ZuKurz {
                erwartet: bytes.len() - buf.remaining() + wrapped_len + noch_fest,
                erhalten: bytes.len(),
            });
        }
        let wrapped_key = buf[..wrapped_len].to_vec();
        buf.advance(wrapped_len);

        let nonce: [u8; NONCE_LAENGE] = lese_array(&mut buf);
        let auth_tag: [u8; TAG_LAENGE] = lese_array(&mut buf);

        let ciphertext_len = buf.get_u32() as usize;
        if buf.remaining() < ciphertext_len {
            return Err(WireError::ZuKurz {
                erwartet: bytes.len() - buf.remaining() + ciphertext_len,
                erhalten: bytes.len(),
            });
        }
        let ciphertext = buf[..ciphertext_len].to_vec();
        buf.advance(ciphertext_len);

        if buf.has_remaining() {
            return Err(WireError::UeberzaehligeBytes(buf.remaining()));
        }

        Ok(Self {
            sender_id,
            receiver_id,
            timestamp_ms,
            metadata_bound: flags & FLAG_METADATEN_GEBUNDEN != 0,
            wrapped_key,
            nonce,
            ciphertext,
            auth_tag,
        })
    }

    /// Base64-Darstellung des Wire-Formats (fuer JSON-Frames)
    pub fn to_base64(&self) -> WireResult<String> {
        Ok(STANDARD.encode(self.to_bytes()?))
    }

    /// Liest ein Envelope aus seiner Base64-Darstellung
    pub fn from_base64(text: &str) -> WireResult<Self> {
        let bytes = STANDARD
            .decode(text)
            .map_err(|e| WireError::Base64(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

/// Liest ein Array fester Laenge; die Laenge wurde vorher geprueft
fn lese_array<const N: usize>(buf: &mut &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    out
}

// ---------------------------------------------------------------------------
// Serde-Anbindung fuer JSON-Frames
// ---------------------------------------------------------------------------

/// Serde-Modul: Envelope als Base64 seines Wire-Formats
///
/// Verwendung: `#[serde(with = "crate::envelope::base64_wire")]`
pub mod base64_wire {
    use serde::{de, Deserialize, Deserializer, Serializer};

    use super::Envelope;

    pub fn serialize<S: Serializer>(envelope: &Envelope, s: S) -> Result<S::Ok, S::Error> {
        let text = envelope
            .to_base64()
            .map_err(serde::ser::Error::custom)?;
        s.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Envelope, D::Error> {
        let text = String::deserialize(d)?;
        Envelope::from_base64(&text).map_err(de::Error::custom)
    }
}

/// Wie [`base64_wire`], fuer eine Liste von Envelopes
pub mod base64_wire_liste {
    use serde::ser::SerializeSeq;
    use serde::{de, Deserialize, Deserializer, Serializer};

    use super::Envelope;

    pub fn serialize<S: Serializer>(envelopes: &[Envelope], s: S) -> Result<S::Ok, S::Error> {
        let mut liste = s.serialize_seq(Some(envelopes.len()))?;
        for envelope in envelopes {
            let text = envelope
                .to_base64()
                .map_err(serde::ser::Error::custom)?;
            liste.serialize_element(&text)?;
        }
        liste.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Envelope>, D::Error> {
        Vec::<String>::deserialize(d)?
            .iter()
            .map(|text| Envelope::from_base64(text).map_err(de::Error::custom))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
