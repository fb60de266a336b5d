//! Gemeinsame Identifikationstypen fuer Kurier
//!
//! Alle IDs verwenden das Newtype-Pattern, damit Identitaeten, Verbindungen
//! und Raeume zur Compilezeit nicht verwechselt werden koennen.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $praefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Erstellt eine neue zufaellige ID (UUID v4)
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Gibt die innere UUID zurueck
            pub fn inner(&self) -> Uuid {
                self.0
            }

            /// Die 16 Rohbytes der UUID (Wire-Format)
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            /// Baut die ID aus 16 Rohbytes
            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($praefix, ":{}"), self.0)
            }
        }
    };
}

uuid_id!(
    /// Verifizierte Identitaet einer Partei (vom Auth-Service ausgestellt)
    IdentityId,
    "identity"
);

uuid_id!(
    /// Eine einzelne Live-Verbindung
    ConnectionId,
    "conn"
);

uuid_id!(
    /// Kennung eines physischen Transport-Handshakes
    ///
    /// Der Transport vergibt sie einmal pro Socket; `connect` ist pro
    /// Handshake idempotent.
    HandshakeId,
    "handshake"
);

/// Raum-Name (frei waehlbar, z.B. "general")
///
/// Raeume werden implizit beim ersten Beitritt angelegt, die ID darf nach
/// dem Aufloesen wiederverwendet werden.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoomId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "room:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_id_eindeutig() {
        let a = IdentityId::new();
        let b = IdentityId::new();
        assert_ne!(a, b, "Zwei neue IdentityIds muessen verschieden sein");
    }

    #[test]
    fn bytes_roundtrip() {
        let id = ConnectionId::new();
        assert_eq!(ConnectionId::from_bytes(*id.as_bytes()), id);
    }

    #[test]
    fn display_praefixe() {
        assert!(IdentityId(Uuid::nil()).to_string().starts_with("identity:"));
        assert!(ConnectionId(Uuid::nil()).to_string().starts_with("conn:"));
        assert_eq!(RoomId::from("general").to_string(), "room:general");
    }

    #[test]
    fn room_id_serialisiert_als_string() {
        let json = serde_json::to_string(&RoomId::from("general")).unwrap();
        assert_eq!(json, "\"general\"");
        let zurueck: RoomId = serde_json::from_str(&json).unwrap();
        assert_eq!(zurueck.as_str(), "general");
    }
}
