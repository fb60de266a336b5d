//! Fehlertypen fuer das Kryptografie-Subsystem
//!
//! Fehlermeldungen enthalten nie Schluesselmaterial oder Klartext.

use kurier_core::types::IdentityId;
use thiserror::Error;

/// Fehler im Kryptografie-Subsystem
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Entropie- oder Parameterfehler bei der Schluesselerzeugung
    #[error("Schluessel-Generierung fehlgeschlagen: {0}")]
    SchluesselGenerierung(String),

    /// Identitaet unbekannt oder privater Schluessel nicht geladen
    #[error("Kein Schluessel fuer {0}")]
    NichtGefunden(IdentityId),

    #[error("Fuer {0} existiert bereits ein Schluesselpaar")]
    BereitsRegistriert(IdentityId),

    /// Wrapped Key fehlerhaft oder passt nicht zum Schluesselpaar
    #[error("Wrapped Key konnte nicht entpackt werden")]
    Unwrap,

    /// GCM-Tag stimmt nicht: Manipulation oder Beschaedigung
    #[error("Authentifizierung des Ciphertexts fehlgeschlagen")]
    Authentifizierung,

    /// Ungueltiger oeffentlicher Schluessel oder Cipher-Fehler
    #[error("Verschluesselung fehlgeschlagen: {0}")]
    Verschluesselung(String),

    #[error("Klartext zu gross: {groesse} Bytes (Maximum: {maximum} Bytes)")]
    PlaintextZuGross { groesse: usize, maximum: usize },

    #[error("Krypto-Operation abgebrochen")]
    Abgebrochen,

    #[error("Krypto-Operation hat das Zeitlimit ueberschritten")]
    Zeitlimit,

    #[error("Interner Fehler: {0}")]
    Intern(String),
}

impl CryptoError {
    /// Verifikationsfehler, die als Sicherheitsereignis gelten
    ///
    /// Diese werden protokolliert und nie automatisch wiederholt.
    pub fn ist_sicherheitsereignis(&self) -> bool {
        matches!(self, Self::Unwrap | Self::Authentifizierung)
    }

    /// Faellt der Fehler unter die Klasse "EncryptionError" (vom Aufrufer behebbar)?
    pub fn ist_verschluesselungsfehler(&self) -> bool {
        matches!(self, Self::Verschluesselung(_) | Self::PlaintextZuGross { .. })
    }
}

pub type CryptoResult<T> = Result<T, CryptoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sicherheitsereignisse() {
        assert!(CryptoError::Unwrap.ist_sicherheitsereignis());
        assert!(CryptoError::Authentifizierung.ist_sicherheitsereignis());
        assert!(!CryptoError::Zeitlimit.ist_sicherheitsereignis());
        assert!(!CryptoError::NichtGefunden(IdentityId::new()).ist_sicherheitsereignis());
    }

    #[test]
    fn zu_grosser_klartext_ist_verschluesselungsfehler() {
        let e = CryptoError::PlaintextZuGross {
            groesse: 10,
            maximum: 5,
        };
        assert!(e.ist_verschluesselungsfehler());
        assert!(e.to_string().contains("10 Bytes"));
    }
}
