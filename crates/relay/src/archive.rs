//! Envelope-Archiv – Schnittstelle zur Persistenz
//!
//! Der Relay uebergibt jedes zugestellte Envelope unveraendert (nur
//! Ciphertext) an das Archiv. Klartext erreicht das Archiv nie.

use chrono::{DateTime, Utc};
use kurier_core::types::RoomId;
use kurier_protocol::Envelope;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Ein archiviertes Envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedEnvelope {
    pub room_id: RoomId,
    pub envelope: Arc<Envelope>,
    pub archiviert_am: DateTime<Utc>,
}

/// Senke fuer unveraenderliche Envelope-Records
///
/// Implementierungen duerfen nicht blockieren; langsame Backends reichen
/// die Records an einen eigenen Task weiter.
pub trait EnvelopeArchive: Send + Sync + 'static {
    fn archive(&self, room_id: &RoomId, envelope: Arc<Envelope>);

    /// Die letzten `limit` Envelopes eines Raums, aelteste zuerst
    fn history(&self, room_id: &RoomId, limit: usize) -> Vec<ArchivedEnvelope>;
}

/// In-Memory-Archiv mit begrenzter Tiefe pro Raum
pub struct MemoryArchive {
    raeume: Mutex<HashMap<RoomId, VecDeque<ArchivedEnvelope>>>,
    max_pro_raum: usize,
}

impl MemoryArchive {
    pub fn neu(max_pro_raum: usize) -> Self {
        Self {
            raeume: Mutex::new(HashMap::new()),
            max_pro_raum,
        }
    }

    /// Anzahl archivierter Envelopes in einem Raum
    pub fn anzahl(&self, room_id: &RoomId) -> usize {
        self.raeume.lock().get(room_id).map_or(0, VecDeque::len)
    }
}

impl Default for MemoryArchive {
    fn default() -> Self {
        Self::neu(1000)
    }
}

impl EnvelopeArchive for MemoryArchive {
    fn archive(&self, room_id: &RoomId, envelope: Arc<Envelope>) {
        if self.max_pro_raum == 0 {
            return;
        }
        let mut raeume = self.raeume.lock();
        let verlauf = raeume.entry(room_id.clone()).or_default();
        if verlauf.len() == self.max_pro_raum {
            verlauf.pop_front();
        }
        verlauf.push_back(ArchivedEnvelope {
            room_id: room_id.clone(),
            envelope,
            archiviert_am: Utc::now(),
        });
    }

    fn history(&self, room_id: &RoomId, limit: usize) -> Vec<ArchivedEnvelope> {
        let raeume = self.raeume.lock();
        let Some(verlauf) = raeume.get(room_id) else {
            return Vec::new();
        };
        let start = verlauf.len().saturating_sub(limit);
        verlauf.iter().skip(start).cloned().collect()
    }
}
