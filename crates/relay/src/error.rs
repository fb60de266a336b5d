//! Fehlertypen fuer den Relay

use kurier_core::types::ConnectionId;
use kurier_crypto::CryptoError;
use kurier_protocol::{ErrorCode, WireError};
use thiserror::Error;

/// Fehlertyp fuer den Relay
#[derive(Debug, Error)]
pub enum RelayError {
    /// Verbindung ist nicht (mehr) registriert
    #[error("Verbindung {0} ist nicht verbunden")]
    NichtVerbunden(ConnectionId),

    /// Identitaet konnte nicht verifiziert werden
    #[error("Nicht authentifiziert: {0}")]
    NichtAuthentifiziert(String),

    /// Protokollfehler (unerwarteter Frame, falscher Zustand)
    #[error("Protokollfehler: {0}")]
    Protokoll(String),

    /// IO-Fehler (TCP, Socket)
    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),

    #[error("Krypto-Fehler: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Wire-Fehler: {0}")]
    Wire(#[from] WireError),
}

impl RelayError {
    /// Erstellt einen Protokollfehler
    pub fn protokoll(msg: impl Into<String>) -> Self {
        Self::Protokoll(msg.into())
    }

    /// Fehler-Code fuer `ServerFrame::Error`
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::NichtVerbunden(_) => ErrorCode::NotConnected,
            Self::NichtAuthentifiziert(_) => ErrorCode::NotAuthenticated,
            Self::Protokoll(_) | Self::Wire(_) => ErrorCode::InvalidRequest,
            Self::Crypto(CryptoError::NichtGefunden(_)) => ErrorCode::NotFound,
            // Vom Client verursacht: manipuliertes oder fremdes Envelope
            Self::Crypto(e) if e.ist_sicherheitsereignis() || e.ist_verschluesselungsfehler() => {
                ErrorCode::InvalidRequest
            }
            Self::Crypto(_) | Self::Io(_) => ErrorCode::InternalError,
        }
    }
}

/// Result-Typ fuer den Relay
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use kurier_core::types::IdentityId;

    #[test]
    fn fehler_codes() {
        assert_eq!(
            RelayError::NichtVerbunden(ConnectionId::new()).error_code(),
            ErrorCode::NotConnected
        );
        assert_eq!(
            RelayError::Crypto(CryptoError::NichtGefunden(IdentityId::new())).error_code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            RelayError::protokoll("x").error_code(),
            ErrorCode::InvalidRequest
        );
        assert_eq!(
            RelayError::Crypto(CryptoError::Authentifizierung).error_code(),
            ErrorCode::InvalidRequest
        );
        assert_eq!(
            RelayError::Crypto(CryptoError::Abgebrochen).error_code(),
            ErrorCode::InternalError
        );
    }
}
