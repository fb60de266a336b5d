//! Session-Registry – Live-Verbindungen und Raum-Mitgliedschaften
//!
//! Der gesamte Mitgliedschafts-Zustand liegt hinter einem einzigen
//! `RwLock`. Dadurch sieht ein Fanout nie einen halb aktualisierten Raum:
//! `disconnect` entfernt eine Verbindung aus allen Raeumen in einem Schritt.
//!
//! ## Getrennte Empfaenger
//! Trennt sich die letzte Verbindung einer Identitaet, waehrend sie Mitglied
//! eines Raums ist, merkt sich die Registry diese Verbindung. Ein spaeteres
//! Envelope an diese Identitaet kann so als `Disconnected` quittiert werden.
//! Der Eintrag verschwindet beim erneuten Beitritt der Identitaet, wenn der
//! Raum leer wird oder nach Ablauf der TTL. Abgelaufene Eintraege werden bei
//! jedem `disconnect` abgeraeumt.

use kurier_core::types::{ConnectionId, HandshakeId, IdentityId, RoomId};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, RelayResult};

/// Wie lange eine getrennte Verbindung als `Disconnected` quittiert wird
pub const DEFAULT_GETRENNT_TTL: Duration = Duration::from_secs(600);

// ---------------------------------------------------------------------------
// Typen
// ---------------------------------------------------------------------------

/// Ergebnis eines `disconnect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub connection_id: ConnectionId,
    pub identity_id: IdentityId,
    /// Raeume, aus denen die Verbindung entfernt wurde
    pub rooms: Vec<RoomId>,
}

/// Konsistenter Blick auf einen Raum fuer einen Fanout
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutSnapshot {
    pub members: BTreeSet<ConnectionId>,
    /// Getrennte Verbindung des adressierten Empfaengers, falls vorhanden
    pub departed: Option<ConnectionId>,
}

#[derive(Clone, Copy)]
struct Getrennt {
    connection_id: ConnectionId,
    seit: Instant,
}

struct Verbindung {
    identity_id: IdentityId,
    handshake_id: HandshakeId,
    rooms: BTreeSet<RoomId>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Zustand {
    verbindungen: HashMap<ConnectionId, Verbindung>,
    handshakes: HashMap<HandshakeId, ConnectionId>,
    raeume: HashMap<RoomId, BTreeSet<ConnectionId>>,
    getrennt: HashMap<(RoomId, IdentityId), Getrennt>,
}

impl Zustand {
    fn identitaet_im_raum(&self, room_id: &RoomId, identity_id: IdentityId) -> bool {
        self.raeume.get(room_id).is_some_and(|mitglieder| {
            mitglieder.iter().any(|c| {
                self.verbindungen
                    .get(c)
                    .is_some_and(|v| v.identity_id == identity_id)
            })
        })
    }

    fn getrennt_in(
        &self,
        room_id: &RoomId,
        identity_id: IdentityId,
        ttl: Duration,
    ) -> Option<ConnectionId> {
        if self.identitaet_im_raum(room_id, identity_id) {
            return None;
        }
        self.getrennt
            .get(&(room_id.clone(), identity_id))
            .filter(|g| g.seit.elapsed() < ttl)
            .map(|g| g.connection_id)
    }

    /// Entfernt eine Verbindung aus einem Raum und raeumt leere Raeume ab
    fn aus_raum_entfernen(&mut self, room_id: &RoomId, connection_id: ConnectionId) -> bool {
        let Some(mitglieder) = self.raeume.get_mut(room_id) else {
            return false;
        };
        let entfernt = mitglieder.remove(&connection_id);
        if mitglieder.is_empty() {
            self.raeume.remove(room_id);
            self.getrennt.retain(|(raum, _), _| raum != room_id);
        }
        entfernt
    }
}

// ---------------------------------------------------------------------------
// SessionRegistry
// ---------------------------------------------------------------------------

/// Registry aller Live-Verbindungen
///
/// Clone teilt den inneren Zustand.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Zustand>>,
    getrennt_ttl: Duration,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::mit_getrennt_ttl(DEFAULT_GETRENNT_TTL)
    }
}

impl SessionRegistry {
    pub fn neu() -> Self {
        Self::default()
    }

    /// Registry mit eigener TTL fuer getrennte Empfaenger
    pub fn mit_getrennt_ttl(getrennt_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Zustand::default())),
            getrennt_ttl,
        }
    }

    /// Registriert eine Verbindung fuer eine verifizierte Identitaet
    ///
    /// Idempotent pro Handshake: derselbe `HandshakeId` liefert die bereits
    /// bestehende Verbindung.
    pub fn connect(&self, identity_id: IdentityId, handshake_id: HandshakeId) -> ConnectionId {
        let mut zustand = self.inner.write();

        if let Some(bestehend) = zustand.handshakes.get(&handshake_id).copied() {
            if zustand.verbindungen.contains_key(&bestehend) {
                return bestehend;
            }
        }

        let connection_id = ConnectionId::new();
        zustand.verbindungen.insert(
            connection_id,
            Verbindung {
                identity_id,
                handshake_id,
                rooms: BTreeSet::new(),
                cancel: CancellationToken::new(),
            },
        );
        zustand.handshakes.insert(handshake_id, connection_id);

        tracing::debug!(
            connection = %connection_id,
            identity = %identity_id,
            "Verbindung registriert"
        );
        connection_id
    }

    /// Entfernt eine Verbindung und alle ihre Mitgliedschaften
    ///
    /// Bricht das Cancellation-Token der Verbindung ab. `None` wenn die
    /// Verbindung bereits weg war.
    pub fn disconnect(&self, connection_id: ConnectionId) -> Option<Departure> {
        let mut zustand = self.inner.write();

        let verbindung = zustand.verbindungen.remove(&connection_id)?;
        zustand.handshakes.remove(&verbindung.handshake_id);

        let ttl = self.getrennt_ttl;
        zustand.getrennt.retain(|_, g| g.seit.elapsed() < ttl);

        let seit = Instant::now();
        let mut rooms = Vec::with_capacity(verbindung.rooms.len());
        for room_id in verbindung.rooms {
            zustand.aus_raum_entfernen(&room_id, connection_id);
            if zustand.raeume.contains_key(&room_id)
                && !zustand.identitaet_im_raum(&room_id, verbindung.identity_id)
            {
                zustand.getrennt.insert(
                    (room_id.clone(), verbindung.identity_id),
                    Getrennt { connection_id, seit },
                );
            }
            rooms.push(room_id);
        }
        drop(zustand);

        verbindung.cancel.cancel();
        tracing::debug!(
            connection = %connection_id,
            identity = %verbindung.identity_id,
            raeume = rooms.len(),
            "Verbindung entfernt"
        );

        Some(Departure {
            connection_id,
            identity_id: verbindung.identity_id,
            rooms,
        })
    }

    /// Tritt einem Raum bei; legt den Raum bei Bedarf an
    ///
    /// Gibt `true` zurueck, wenn die Verbindung vorher kein Mitglied war.
    pub fn join(&self, connection_id: ConnectionId, room_id: &RoomId) -> RelayResult<bool> {
        let mut zustand = self.inner.write();

        let verbindung = zustand
            .verbindungen
            .get_mut(&connection_id)
            .ok_or(RelayError::NichtVerbunden(connection_id))?;
        let neu = verbindung.rooms.insert(room_id.clone());
        let identity_id = verbindung.identity_id;

        zustand
            .raeume
            .entry(room_id.clone())
            .or_default()
            .insert(connection_id);
        zustand.getrennt.remove(&(room_id.clone(), identity_id));

        Ok(neu)
    }

    /// Verlaesst einen Raum
    ///
    /// No-op (`false`) wenn die Verbindung kein Mitglied ist.
    pub fn leave(&self, connection_id: ConnectionId, room_id: &RoomId) -> RelayResult<bool> {
        let mut zustand = self.inner.write();

        let verbindung = zustand
            .verbindungen
            .get_mut(&connection_id)
            .ok_or(RelayError::NichtVerbunden(connection_id))?;
        if !verbindung.rooms.remove(room_id) {
            return Ok(false);
        }

        zustand.aus_raum_entfernen(room_id, connection_id);
        Ok(true)
    }

    /// Momentaufnahme der Mitglieder eines Raums
    pub fn members_of(&self, room_id: &RoomId) -> BTreeSet<ConnectionId> {
        self.inner
            .read()
            .raeume
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Mitglieder und getrennter Empfaenger unter demselben Lock
    pub fn fanout_snapshot(&self, room_id: &RoomId, receiver: IdentityId) -> FanoutSnapshot {
        let zustand = self.inner.read();
        FanoutSnapshot {
            members: zustand.raeume.get(room_id).cloned().unwrap_or_default(),
            departed: zustand.getrennt_in(room_id, receiver, self.getrennt_ttl),
        }
    }

    /// Letzte Verbindung einer Identitaet, die sich als Mitglied des Raums
    /// getrennt hat und seitdem nicht zurueckgekehrt ist
    pub fn departed_in(&self, room_id: &RoomId, identity_id: IdentityId) -> Option<ConnectionId> {
        self.inner
            .read()
            .getrennt_in(room_id, identity_id, self.getrennt_ttl)
    }

    /// Anzahl gemerkter getrennter Empfaenger (inklusive noch nicht
    /// abgeraeumter abgelaufener Eintraege)
    pub fn getrennt_anzahl(&self) -> usize {
        self.inner.read().getrennt.len()
    }

    pub fn identity_of(&self, connection_id: ConnectionId) -> Option<IdentityId> {
        self.inner
            .read()
            .verbindungen
            .get(&connection_id)
            .map(|v| v.identity_id)
    }

    pub fn rooms_of(&self, connection_id: ConnectionId) -> Option<BTreeSet<RoomId>> {
        self.inner
            .read()
            .verbindungen
            .get(&connection_id)
            .map(|v| v.rooms.clone())
    }

    /// Ist die Verbindung Mitglied des Raums?
    pub fn ist_mitglied(&self, connection_id: ConnectionId, room_id: &RoomId) -> bool {
        self.inner
            .read()
            .verbindungen
            .get(&connection_id)
            .is_some_and(|v| v.rooms.contains(room_id))
    }

    /// Token, das beim `disconnect` der Verbindung ausgeloest wird
    pub fn cancellation(&self, connection_id: ConnectionId) -> Option<CancellationToken> {
        self.inner
            .read()
            .verbindungen
            .get(&connection_id)
            .map(|v| v.cancel.clone())
    }

    /// Hat die Identitaet noch mindestens eine Live-Verbindung?
    pub fn ist_online(&self, identity_id: IdentityId) -> bool {
        self.inner
            .read()
            .verbindungen
            .values()
            .any(|v| v.identity_id == identity_id)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.read().verbindungen.len()
    }

    pub fn room_count(&self) -> usize {
        self.inner.read().raeume.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn raum(name: &str) -> RoomId {
        RoomId::from(name)
    }

    #[test]
    fn connect_ist_idempotent_pro_handshake() {
        let registry = SessionRegistry::neu();
        let alice = IdentityId::new();
        let handshake = HandshakeId::new();

        let c1 = registry.connect(alice, handshake);
        let c2 = registry.connect(alice, handshake);
        assert_eq!(c1, c2);
        assert_eq!(registry.connection_count(), 1);

        let c3 = registry.connect(alice, HandshakeId::new());
        assert_ne!(c1, c3);
        assert_eq!(registry.connection_count(), 2);
    }

    #[test]
    fn handshake_nach_disconnect_erzeugt_neue_verbindung() {
        let registry = SessionRegistry::neu();
        let handshake = HandshakeId::new();
        let c1 = registry.connect(IdentityId::new(), handshake);
        registry.disconnect(c1);

        let c2 = registry.connect(IdentityId::new(), handshake);
        assert_ne!(c1, c2);
    }

    #[test]
    fn join_und_leave() {
        let registry = SessionRegistry::neu();
        let c = registry.connect(IdentityId::new(), HandshakeId::new());
        let general = raum("general");

        assert!(registry.join(c, &general).unwrap());
        assert!(!registry.join(c, &general).unwrap());
        assert_eq!(registry.members_of(&general), BTreeSet::from([c]));
        assert_eq!(registry.rooms_of(c).unwrap(), BTreeSet::from([general.clone()]));

        assert!(registry.leave(c, &general).unwrap());
        assert!(!registry.leave(c, &general).unwrap());
        assert!(registry.members_of(&general).is_empty());
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn unbekannte_verbindung_ist_nicht_verbunden() {
        let registry = SessionRegistry::neu();
        let geist = ConnectionId::new();
        assert!(matches!(
            registry.join(geist, &raum("x")),
            Err(RelayError::NichtVerbunden(id)) if id == geist
        ));
        assert!(matches!(
            registry.leave(geist, &raum("x")),
            Err(RelayError::NichtVerbunden(_))
        ));
        assert!(registry.disconnect(geist).is_none());
    }

    #[test]
    fn disconnect_entfernt_aus_allen_raeumen() {
        let registry = SessionRegistry::neu();
        let alice = IdentityId::new();
        let c1 = registry.connect(alice, HandshakeId::new());
        let c2 = registry.connect(IdentityId::new(), HandshakeId::new());
        for name in ["a", "b", "c"] {
            registry.join(c1, &raum(name)).unwrap();
            registry.join(c2, &raum(name)).unwrap();
        }
        let token = registry.cancellation(c1).unwrap();

        let abgang = registry.disconnect(c1).unwrap();
        assert_eq!(abgang.identity_id, alice);
        assert_eq!(abgang.rooms.len(), 3);
        assert!(token.is_cancelled());
        for name in ["a", "b", "c"] {
            assert_eq!(registry.members_of(&raum(name)), BTreeSet::from([c2]));
        }
        assert!(registry.identity_of(c1).is_none());
        assert!(registry.disconnect(c1).is_none());
    }

    #[test]
    fn getrennter_empfaenger_wird_gemerkt() {
        let registry = SessionRegistry::neu();
        let alice = IdentityId::new();
        let bob = IdentityId::new();
        let general = raum("general");

        let c1 = registry.connect(alice, HandshakeId::new());
        let c2 = registry.connect(bob, HandshakeId::new());
        registry.join(c1, &general).unwrap();
        registry.join(c2, &general).unwrap();

        registry.disconnect(c2);
        assert_eq!(registry.departed_in(&general, bob), Some(c2));
        assert_eq!(
            registry.fanout_snapshot(&general, bob),
            FanoutSnapshot {
                members: BTreeSet::from([c1]),
                departed: Some(c2),
            }
        );

        // Rueckkehr loescht den Eintrag
        let c3 = registry.connect(bob, HandshakeId::new());
        registry.join(c3, &general).unwrap();
        assert_eq!(registry.departed_in(&general, bob), None);
    }

    #[test]
    fn zweite_verbindung_derselben_identitaet_verhindert_eintrag() {
        let registry = SessionRegistry::neu();
        let bob = IdentityId::new();
        let general = raum("general");

        let laptop = registry.connect(bob, HandshakeId::new());
        let handy = registry.connect(bob, HandshakeId::new());
        registry.join(laptop, &general).unwrap();
        registry.join(handy, &general).unwrap();

        registry.disconnect(laptop);
        assert_eq!(registry.departed_in(&general, bob), None);
        assert!(registry.ist_online(bob));
    }

    #[tokio::test(start_paused = true)]
    async fn getrennte_eintraege_verfallen_nach_ttl() {
        let registry = SessionRegistry::mit_getrennt_ttl(Duration::from_secs(60));
        let general = raum("general");
        let bleibt = registry.connect(IdentityId::new(), HandshakeId::new());
        registry.join(bleibt, &general).unwrap();

        let bob = IdentityId::new();
        let c_bob = registry.connect(bob, HandshakeId::new());
        registry.join(c_bob, &general).unwrap();
        registry.disconnect(c_bob);
        assert_eq!(registry.departed_in(&general, bob), Some(c_bob));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(registry.departed_in(&general, bob), None);
        assert_eq!(registry.fanout_snapshot(&general, bob).departed, None);
        assert_eq!(registry.getrennt_anzahl(), 1);

        // Der naechste disconnect raeumt den abgelaufenen Eintrag ab
        let carol = IdentityId::new();
        let c_carol = registry.connect(carol, HandshakeId::new());
        registry.join(c_carol, &general).unwrap();
        registry.disconnect(c_carol);
        assert_eq!(registry.getrennt_anzahl(), 1);
        assert_eq!(registry.departed_in(&general, carol), Some(c_carol));
    }

    #[test]
    fn viele_abgaenge_bleiben_begrenzt() {
        let registry = SessionRegistry::mit_getrennt_ttl(Duration::ZERO);
        let general = raum("general");
        let bleibt = registry.connect(IdentityId::new(), HandshakeId::new());
        registry.join(bleibt, &general).unwrap();

        for _ in 0..100 {
            let c = registry.connect(IdentityId::new(), HandshakeId::new());
            registry.join(c, &general).unwrap();
            registry.disconnect(c);
        }
        assert!(registry.getrennt_anzahl() <= 1);
    }

    #[test]
    fn leerer_raum_vergisst_getrennte() {
        let registry = SessionRegistry::neu();
        let bob = IdentityId::new();
        let general = raum("general");

        let c1 = registry.connect(IdentityId::new(), HandshakeId::new());
        let c2 = registry.connect(bob, HandshakeId::new());
        registry.join(c1, &general).unwrap();
        registry.join(c2, &general).unwrap();
        registry.disconnect(c2);
        registry.leave(c1, &general).unwrap();

        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.departed_in(&general, bob), None);
    }
}
