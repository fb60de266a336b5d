//! Fehlertypen fuer das Envelope-Wire-Format

use thiserror::Error;

/// Fehler beim Dekodieren oder Kodieren eines Envelopes
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("Envelope zu kurz: mindestens {erwartet} Bytes erwartet, {erhalten} erhalten")]
    ZuKurz { erwartet: usize, erhalten: usize },

    #[error("Ungueltige Magic-Bytes")]
    FalscheMagic,

    #[error("Unbekannte Envelope-Version: {0}")]
    UnbekannteVersion(u8),

    #[error("Unbekannte Flag-Bits: {0:#04x}")]
    UnbekannteFlags(u8),

    #[error("{0} ueberzaehlige Bytes nach dem Envelope")]
    UeberzaehligeBytes(usize),

    #[error("Wrapped Key zu lang: {0} Bytes")]
    WrappedKeyZuLang(usize),

    #[error("Ciphertext zu lang: {0} Bytes")]
    CiphertextZuLang(usize),

    #[error("Base64-Dekodierung fehlgeschlagen: {0}")]
    Base64(String),
}

pub type WireResult<T> = Result<T, WireError>;
