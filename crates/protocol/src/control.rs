//! Transport-Frames zwischen Client und Relay
//!
//! Definiert die logischen Ereignisse der Verbindung (`join`, `leave`,
//! `publish`, `receive`) sowie Zustell-Quittungen und Steuer-Events.
//!
//! ## Design
//! - JSON-Serialisierung via serde, Tagged Enums (`"type"`)
//! - Envelopes reisen als Base64 ihres binaeren Wire-Formats
//! - Anfragen mit Antwort tragen eine `request_id: u32`

use kurier_core::types::{ConnectionId, IdentityId, RoomId};
use serde::{Deserialize, Serialize};

use crate::envelope::{base64_wire, base64_wire_liste, Envelope};

// ---------------------------------------------------------------------------
// Fehler-Codes
// ---------------------------------------------------------------------------

/// Standardisierte Fehler-Codes fuer `ServerFrame::Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InternalError,
    InvalidRequest,
    NotAuthenticated,
    NotConnected,
    NotFound,
}

// ---------------------------------------------------------------------------
// Steuer-Events
// ---------------------------------------------------------------------------

/// Grund fuer das Verlassen eines Raums
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    /// Expliziter `leave`-Aufruf
    Verlassen,
    /// Verbindung wurde getrennt
    Getrennt,
}

/// Steuer-Envelope fuer Raum-Mitgliedschaften
///
/// Laeuft ueber denselben Zustellpfad wie Inhalts-Envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlEvent {
    Joined {
        connection_id: ConnectionId,
        identity_id: IdentityId,
    },
    Left {
        connection_id: ConnectionId,
        identity_id: IdentityId,
        reason: LeaveReason,
    },
}

impl ControlEvent {
    /// Die Identitaet, die das Event ausgeloest hat
    pub fn identity_id(&self) -> IdentityId {
        match self {
            Self::Joined { identity_id, .. } | Self::Left { identity_id, .. } => *identity_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Zustell-Quittung
// ---------------------------------------------------------------------------

/// Grund fuer eine fehlgeschlagene Zustellung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryFailure {
    /// Send-Queue blieb bis zum Timeout voll
    Backpressure,
    /// Empfangsseite der Queue ist geschlossen (Socket zu)
    Closed,
    /// Fuer die Verbindung ist keine Send-Queue registriert
    Detached,
    /// Der adressierte Empfaenger hat den Raum durch Trennung verlassen
    Disconnected,
}

/// Eine fehlgeschlagene Zustellung an eine Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDelivery {
    pub connection_id: ConnectionId,
    pub reason: DeliveryFailure,
}

/// Ergebnis eines `publish`-Aufrufs
///
/// Teilweise Fehlschlaege sind erwartet und werden hier festgehalten statt
/// als Fehler gemeldet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub room_id: RoomId,
    pub delivered: Vec<ConnectionId>,
    pub failed: Vec<FailedDelivery>,
}

impl DeliveryReceipt {
    pub fn neu(room_id: RoomId) -> Self {
        Self {
            room_id,
            delivered: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Wurde an diese Verbindung zugestellt?
    pub fn ist_zugestellt(&self, connection_id: &ConnectionId) -> bool {
        self.delivered.contains(connection_id)
    }

    /// Fehlergrund fuer eine Verbindung, falls die Zustellung scheiterte
    pub fn fehler_fuer(&self, connection_id: &ConnectionId) -> Option<DeliveryFailure> {
        self.failed
            .iter()
            .find(|f| &f.connection_id == connection_id)
            .map(|f| f.reason)
    }

    /// Keine einzige fehlgeschlagene Zustellung
    pub fn vollstaendig(&self) -> bool {
        self.failed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Frames vom Client an den Relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Erster Frame jeder Verbindung: verifizierte Identitaet
    Hello {
        identity_id: IdentityId,
        token: String,
    },
    Join {
        room_id: RoomId,
    },
    Leave {
        room_id: RoomId,
    },
    Publish {
        request_id: u32,
        room_id: RoomId,
        #[serde(with = "base64_wire")]
        envelope: Envelope,
    },
    PublicKeyRequest {
        request_id: u32,
        identity_id: IdentityId,
    },
    /// Entschluesselung eines an die eigene Identitaet adressierten Envelopes
    Decrypt {
        request_id: u32,
        #[serde(with = "base64_wire")]
        envelope: Envelope,
    },
    /// Die letzten `limit` archivierten Envelopes eines Raums
    History {
        request_id: u32,
        room_id: RoomId,
        limit: u32,
    },
    Ping {
        request_id: u32,
    },
}

/// Frames vom Relay an den Client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        connection_id: ConnectionId,
        identity_id: IdentityId,
    },
    Receive {
        room_id: RoomId,
        #[serde(with = "base64_wire")]
        envelope: Envelope,
    },
    Control {
        room_id: RoomId,
        event: ControlEvent,
    },
    Receipt {
        request_id: u32,
        receipt: DeliveryReceipt,
    },
    PublicKey {
        request_id: u32,
        identity_id: IdentityId,
        /// DER-kodierter SubjectPublicKeyInfo, Base64
        public_key_der: String,
    },
    /// Klartext, Base64
    Decrypted {
        request_id: u32,
        plaintext: String,
    },
    History {
        request_id: u32,
        room_id: RoomId,
        /// Aelteste zuerst
        #[serde(with = "base64_wire_liste")]
        envelopes: Vec<Envelope>,
    },
    Pong {
        request_id: u32,
    },
    Error {
        request_id: Option<u32>,
        code: ErrorCode,
        message: String,
    },
}

impl ServerFrame {
    /// Erstellt einen Fehler-Frame
    pub fn error(request_id: Option<u32>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            request_id,
            code,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{NONCE_LAENGE, TAG_LAENGE};

    fn test_envelope() -> Envelope {
        Envelope {
            sender_id: IdentityId::new(),
            receiver_id: IdentityId::new(),
            timestamp_ms: 42,
            metadata_bound: false,
            wrapped_key: vec![1, 2, 3],
            nonce: [0u8; NONCE_LAENGE],
            ciphertext: vec![4, 5, 6],
            auth_tag: [0u8; TAG_LAENGE],
        }
    }

    #[test]
    fn publish_frame_traegt_envelope_als_base64() {
        let frame = ClientFrame::Publish {
            request_id: 7,
            room_id: RoomId::from("general"),
            envelope: test_envelope(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "publish");
        assert_eq!(json["room_id"], "general");
        assert!(json["envelope"].is_string());

        let zurueck: ClientFrame = serde_json::from_value(json).unwrap();
        assert_eq!(zurueck, frame);
    }

    #[test]
    fn kaputtes_envelope_im_frame_wird_abgelehnt() {
        let json = r#"{"type":"publish","request_id":1,"room_id":"r","envelope":"AAAA"}"#;
        assert!(serde_json::from_str::<ClientFrame>(json).is_err());
    }

    #[test]
    fn history_frame_traegt_liste_von_envelopes() {
        let frame = ServerFrame::History {
            request_id: 4,
            room_id: RoomId::from("general"),
            envelopes: vec![test_envelope(), test_envelope()],
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "history");
        assert_eq!(json["envelopes"].as_array().map(Vec::len), Some(2));
        assert!(json["envelopes"][0].is_string());

        let zurueck: ServerFrame = serde_json::from_value(json).unwrap();
        assert_eq!(zurueck, frame);

        let anfrage = r#"{"type":"history","request_id":1,"room_id":"general","limit":20}"#;
        assert_eq!(
            serde_json::from_str::<ClientFrame>(anfrage).unwrap(),
            ClientFrame::History {
                request_id: 1,
                room_id: RoomId::from("general"),
                limit: 20,
            }
        );
    }

    #[test]
    fn control_event_json_form() {
        let event = ControlEvent::Left {
            connection_id: ConnectionId::new(),
            identity_id: IdentityId::new(),
            reason: LeaveReason::Getrennt,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "left");
        assert_eq!(json["reason"], "getrennt");
    }

    #[test]
    fn quittung_abfragen() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        let mut quittung = DeliveryReceipt::neu(RoomId::from("general"));
        quittung.delivered.push(a);
        quittung.failed.push(FailedDelivery {
            connection_id: b,
            reason: DeliveryFailure::Closed,
        });

        assert!(quittung.ist_zugestellt(&a));
        assert!(!quittung.ist_zugestellt(&b));
        assert_eq!(quittung.fehler_fuer(&b), Some(DeliveryFailure::Closed));
        assert_eq!(quittung.fehler_fuer(&a), None);
        assert!(!quittung.vollstaendig());
    }

    #[test]
    fn error_frame_code_format() {
        let frame = ServerFrame::error(Some(3), ErrorCode::NotConnected, "weg");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["code"], "NOT_CONNECTED");
        assert_eq!(json["request_id"], 3);
    }
}
