//! Delivery-Router – Fanout von Envelopes an alle Mitglieder eines Raums
//!
//! Verwaltet die Send-Queues aller Verbindungen und verteilt veroeffentlichte
//! Envelopes an die aktuellen Raum-Mitglieder.
//!
//! ## Garantien
//! - Reihenfolge pro Absender: `publish`-Aufrufe derselben Absender-Identitaet
//!   laufen nacheinander durch einen asynchronen Lock, jeder Empfaenger sieht
//!   sie in Aufrufreihenfolge. Zwischen Absendern gibt es keine Ordnung.
//! - Pro Empfaenger wird zuerst ein Queue-Slot reserviert und dann gesendet:
//!   ein Envelope landet ganz oder gar nicht in der Queue.
//! - Teilweise Fehlschlaege landen in der `DeliveryReceipt`, nie als Fehler.
//! - Join/Leave/Disconnect laufen als `ControlEvent` ueber denselben Pfad.

use dashmap::DashMap;
use futures_util::future::join_all;
use kurier_core::types::{ConnectionId, IdentityId, RoomId};
use kurier_protocol::{
    ControlEvent, DeliveryFailure, DeliveryReceipt, Envelope, FailedDelivery, LeaveReason,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use crate::archive::EnvelopeArchive;
use crate::error::{RelayError, RelayResult};
use crate::registry::{Departure, SessionRegistry};

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Standard-Groesse der Send-Queue pro Verbindung
pub const DEFAULT_QUEUE_KAPAZITAET: usize = 64;

/// Konfiguration fuer den Router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterConfig {
    /// Groesse der Send-Queue pro Verbindung
    pub queue_kapazitaet: usize,
    /// Wie lange auf einen freien Queue-Slot gewartet wird
    pub send_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            queue_kapazitaet: DEFAULT_QUEUE_KAPAZITAET,
            send_timeout: Duration::from_millis(250),
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Eintrag in der Send-Queue einer Verbindung
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Envelope {
        room_id: RoomId,
        envelope: Arc<Envelope>,
    },
    Control {
        room_id: RoomId,
        event: ControlEvent,
    },
}

impl Delivery {
    pub fn room_id(&self) -> &RoomId {
        match self {
            Self::Envelope { room_id, .. } | Self::Control { room_id, .. } => room_id,
        }
    }
}

// ---------------------------------------------------------------------------
// DeliveryRouter
// ---------------------------------------------------------------------------

/// Zentraler Router fuer alle Verbindungen
///
/// Thread-safe via Arc + DashMap. Clone teilt den inneren Zustand.
#[derive(Clone)]
pub struct DeliveryRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    registry: SessionRegistry,
    /// Send-Queues, indiziert nach ConnectionId
    queues: DashMap<ConnectionId, mpsc::Sender<Delivery>>,
    /// Serialisiert Fanouts pro Absender-Identitaet
    absender_locks: DashMap<IdentityId, Arc<Mutex<()>>>,
    archive: Arc<dyn EnvelopeArchive>,
    config: RouterConfig,
}

impl DeliveryRouter {
    /// Erstellt einen neuen Router ueber der gegebenen Registry
    pub fn neu(
        registry: SessionRegistry,
        archive: Arc<dyn EnvelopeArchive>,
        config: RouterConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                registry,
                queues: DashMap::new(),
                absender_locks: DashMap::new(),
                archive,
                config,
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn archive(&self) -> &Arc<dyn EnvelopeArchive> {
        &self.inner.archive
    }

    /// Legt die Send-Queue einer Verbindung an
    ///
    /// Der Verbindungs-Task liest aus dem Receiver und schreibt auf den Socket.
    /// Ein erneuter Aufruf ersetzt die alte Queue.
    pub fn attach(&self, connection_id: ConnectionId) -> mpsc::Receiver<Delivery> {
        let (tx, rx) = mpsc::channel(self.inner.config.queue_kapazitaet.max(1));
        self.inner.queues.insert(connection_id, tx);
        tracing::debug!(connection = %connection_id, "Send-Queue angelegt");
        rx
    }

    /// Entfernt die Send-Queue einer Verbindung
    pub fn detach(&self, connection_id: ConnectionId) {
        self.inner.queues.remove(&connection_id);
    }

    pub fn ist_angebunden(&self, connection_id: ConnectionId) -> bool {
        self.inner.queues.contains_key(&connection_id)
    }

    /// Verteilt ein Envelope an alle aktuellen Mitglieder des Raums
    ///
    /// Die Mitgliederliste wird einmal unter dem Registry-Lock erfasst.
    /// Anschliessend geht das Envelope an das Archiv.
    pub async fn publish(&self, room_id: &RoomId, envelope: Envelope) -> DeliveryReceipt {
        let lock = self.absender_lock(envelope.sender_id);
        let reihenfolge = lock.lock().await;

        let snapshot = self
            .inner
            .registry
            .fanout_snapshot(room_id, envelope.receiver_id);
        let envelope = Arc::new(envelope);

        let zustellung = Delivery::Envelope {
            room_id: room_id.clone(),
            envelope: Arc::clone(&envelope),
        };
        let mut quittung = self.verteilen(room_id, snapshot.members, zustellung).await;

        if let Some(getrennt) = snapshot.departed {
            quittung.failed.push(FailedDelivery {
                connection_id: getrennt,
                reason: DeliveryFailure::Disconnected,
            });
        }
        drop(reihenfolge);
        drop(lock);
        self.lock_freigeben(envelope.sender_id);

        self.inner.archive.archive(room_id, Arc::clone(&envelope));

        tracing::debug!(
            raum = %room_id,
            absender = %envelope.sender_id,
            zugestellt = quittung.delivered.len(),
            fehlgeschlagen = quittung.failed.len(),
            "Envelope verteilt"
        );
        quittung
    }

    /// Tritt einem Raum bei und meldet `Joined` an alle Mitglieder
    pub async fn join(&self, connection_id: ConnectionId, room_id: &RoomId) -> RelayResult<bool> {
        let registry = &self.inner.registry;
        let identity_id = registry
            .identity_of(connection_id)
            .ok_or(RelayError::NichtVerbunden(connection_id))?;

        let lock = self.absender_lock(identity_id);
        let reihenfolge = lock.lock().await;

        let ergebnis = registry.join(connection_id, room_id);
        if let Ok(true) = ergebnis {
            let event = ControlEvent::Joined {
                connection_id,
                identity_id,
            };
            self.steuern(room_id, event).await;
            tracing::info!(connection = %connection_id, raum = %room_id, "Raum beigetreten");
        }
        drop(reihenfolge);
        drop(lock);
        self.lock_freigeben(identity_id);
        ergebnis
    }

    /// Verlaesst einen Raum und meldet `Left` an die verbleibenden Mitglieder
    pub async fn leave(&self, connection_id: ConnectionId, room_id: &RoomId) -> RelayResult<bool> {
        let registry = &self.inner.registry;
        let identity_id = registry
            .identity_of(connection_id)
            .ok_or(RelayError::NichtVerbunden(connection_id))?;

        let lock = self.absender_lock(identity_id);
        let reihenfolge = lock.lock().await;

        let ergebnis = registry.leave(connection_id, room_id);
        if let Ok(true) = ergebnis {
            let event = ControlEvent::Left {
                connection_id,
                identity_id,
                reason: LeaveReason::Verlassen,
            };
            self.steuern(room_id, event).await;
            tracing::info!(connection = %connection_id, raum = %room_id, "Raum verlassen");
        }
        drop(reihenfolge);
        drop(lock);
        self.lock_freigeben(identity_id);
        ergebnis
    }

    /// Trennt eine Verbindung: Registry, Send-Queue und `Left`-Events
    ///
    /// No-op (`None`) wenn die Verbindung bereits getrennt war.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> Option<Departure> {
        let identity_id = self.inner.registry.identity_of(connection_id)?;
        let lock = self.absender_lock(identity_id);
        let reihenfolge = lock.lock().await;

        let abgang = self.inner.registry.disconnect(connection_id);
        self.detach(connection_id);

        if let Some(abgang) = &abgang {
            for room_id in &abgang.rooms {
                let event = ControlEvent::Left {
                    connection_id,
                    identity_id,
                    reason: LeaveReason::Getrennt,
                };
                self.steuern(room_id, event).await;
            }
        }
        drop(reihenfolge);
        drop(lock);
        self.lock_freigeben(identity_id);
        abgang
    }

    /// Verteilt ein Steuer-Event an die aktuellen Mitglieder
    ///
    /// Aufrufer haelt den Absender-Lock der ausloesenden Identitaet.
    async fn steuern(&self, room_id: &RoomId, event: ControlEvent) -> DeliveryReceipt {
        let mitglieder = self.inner.registry.members_of(room_id);
        let zustellung = Delivery::Control {
            room_id: room_id.clone(),
            event,
        };
        let quittung = self.verteilen(room_id, mitglieder, zustellung).await;
        if !quittung.vollstaendig() {
            tracing::debug!(
                raum = %room_id,
                fehlgeschlagen = quittung.failed.len(),
                "Steuer-Event nicht an alle zugestellt"
            );
        }
        quittung
    }

    async fn verteilen(
        &self,
        room_id: &RoomId,
        empfaenger: impl IntoIterator<Item = ConnectionId>,
        zustellung: Delivery,
    ) -> DeliveryReceipt {
        let versuche = empfaenger.into_iter().map(|connection_id| {
            let zustellung = zustellung.clone();
            async move { (connection_id, self.einreihen(connection_id, zustellung).await) }
        });

        let mut quittung = DeliveryReceipt::neu(room_id.clone());
        for (connection_id, ergebnis) in join_all(versuche).await {
            match ergebnis {
                Ok(()) => quittung.delivered.push(connection_id),
                Err(reason) => quittung.failed.push(FailedDelivery {
                    connection_id,
                    reason,
                }),
            }
        }
        quittung
    }

    /// Reiht eine Zustellung in die Queue einer Verbindung ein
    ///
    /// Reserviert zuerst einen Slot (mit Timeout) und sendet dann.
    async fn einreihen(
        &self,
        connection_id: ConnectionId,
        zustellung: Delivery,
    ) -> Result<(), DeliveryFailure> {
        let sender = match self.inner.queues.get(&connection_id) {
            Some(sender) => sender.clone(),
            None => {
                tracing::debug!(connection = %connection_id, "Keine Send-Queue angebunden");
                return Err(DeliveryFailure::Detached);
            }
        };

        let reserviert = tokio::time::timeout(self.inner.config.send_timeout, sender.reserve()).await;
        match reserviert {
            Ok(Ok(slot)) => {
                slot.send(zustellung);
                Ok(())
            }
            Ok(Err(_)) => {
                tracing::debug!(connection = %connection_id, "Send-Queue geschlossen (Verbindung getrennt)");
                Err(DeliveryFailure::Closed)
            }
            Err(_) => {
                tracing::warn!(connection = %connection_id, "Send-Queue voll, Zustellung verworfen");
                Err(DeliveryFailure::Backpressure)
            }
        }
    }

    fn absender_lock(&self, identity_id: IdentityId) -> Arc<Mutex<()>> {
        self.inner
            .absender_locks
            .entry(identity_id)
            .or_default()
            .clone()
    }

    /// Entfernt den Absender-Lock, sobald niemand mehr darauf wartet
    ///
    /// Wer den Lock haelt oder auf ihn wartet, besitzt einen eigenen Klon; die
    /// Map-Referenz ist dann nicht die einzige und der Eintrag bleibt.
    fn lock_freigeben(&self, identity_id: IdentityId) {
        self.inner
            .absender_locks
            .remove_if(&identity_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Anzahl aktuell gehaltener Absender-Locks
    pub fn absender_lock_anzahl(&self) -> usize {
        self.inner.absender_locks.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;
    use kurier_core::types::HandshakeId;
    use kurier_protocol::{NONCE_LAENGE, TAG_LAENGE};

    fn router_mit(config: RouterConfig) -> (DeliveryRouter, Arc<MemoryArchive>) {
        let archiv = Arc::new(MemoryArchive::default());
        let router = DeliveryRouter::neu(SessionRegistry::neu(), archiv.clone(), config);
        (router, archiv)
    }

    fn envelope(sender: IdentityId, receiver: IdentityId, nr: i64) -> Envelope {
        Envelope {
            sender_id: sender,
            receiver_id: receiver,
            timestamp_ms: nr,
            metadata_bound: false,
            wrapped_key: vec![0xAA; 4],
            nonce: [0; NONCE_LAENGE],
            ciphertext: nr.to_be_bytes().to_vec(),
            auth_tag: [0; TAG_LAENGE],
        }
    }

    fn verbinden(router: &DeliveryRouter, identity: IdentityId) -> ConnectionId {
        router.registry().connect(identity, HandshakeId::new())
    }

    #[tokio::test]
    async fn attach_und_publish() {
        let (router, archiv) = router_mit(RouterConfig::default());
        let alice = IdentityId::new();
        let c = verbinden(&router, alice);
        let mut rx = router.attach(c);
        let raum = RoomId::from("r");
        router.join(c, &raum).await.unwrap();

        // Eigenes Joined-Event
        assert!(matches!(rx.recv().await, Some(Delivery::Control { .. })));

        let quittung = router.publish(&raum, envelope(alice, alice, 1)).await;
        assert_eq!(quittung.delivered, vec![c]);
        assert!(quittung.vollstaendig());
        match rx.recv().await {
            Some(Delivery::Envelope { envelope, .. }) => assert_eq!(envelope.timestamp_ms, 1),
            andere => panic!("Envelope erwartet, erhalten: {andere:?}"),
        }
        assert_eq!(archiv.anzahl(&raum), 1);
    }

    #[tokio::test]
    async fn ohne_queue_ist_detached() {
        let (router, _) = router_mit(RouterConfig::default());
        let alice = IdentityId::new();
        let c = verbinden(&router, alice);
        let raum = RoomId::from("r");
        router.join(c, &raum).await.unwrap();

        let quittung = router.publish(&raum, envelope(alice, alice, 1)).await;
        assert_eq!(quittung.fehler_fuer(&c), Some(DeliveryFailure::Detached));
    }

    #[tokio::test]
    async fn geschlossene_queue_ist_closed() {
        let (router, _) = router_mit(RouterConfig::default());
        let alice = IdentityId::new();
        let c = verbinden(&router, alice);
        let raum = RoomId::from("r");
        router.join(c, &raum).await.unwrap();
        drop(router.attach(c));

        let quittung = router.publish(&raum, envelope(alice, alice, 1)).await;
        assert_eq!(quittung.fehler_fuer(&c), Some(DeliveryFailure::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn volle_queue_ist_backpressure() {
        let (router, _) = router_mit(RouterConfig {
            queue_kapazitaet: 1,
            send_timeout: Duration::from_millis(50),
        });
        let alice = IdentityId::new();
        let c = verbinden(&router, alice);
        let _rx = router.attach(c);
        let raum = RoomId::from("r");
        // Joined-Event belegt den einzigen Slot
        router.join(c, &raum).await.unwrap();

        let quittung = router.publish(&raum, envelope(alice, alice, 1)).await;
        assert_eq!(quittung.fehler_fuer(&c), Some(DeliveryFailure::Backpressure));
    }

    #[tokio::test]
    async fn join_unbekannter_verbindung() {
        let (router, _) = router_mit(RouterConfig::default());
        let result = router.join(ConnectionId::new(), &RoomId::from("r")).await;
        assert!(matches!(
            result,
            Err(RelayError::NichtVerbunden(_))
        ));
    }

    #[tokio::test]
    async fn absender_locks_werden_nach_gebrauch_entfernt() {
        let (router, _) = router_mit(RouterConfig::default());
        let alice = IdentityId::new();
        let c = verbinden(&router, alice);
        let _rx = router.attach(c);
        let raum = RoomId::from("r");

        router.join(c, &raum).await.unwrap();
        assert_eq!(router.absender_lock_anzahl(), 0);

        // Absender ohne Verbindung, nur ueber die API
        for nr in 0..10 {
            router.publish(&raum, envelope(IdentityId::new(), alice, nr)).await;
        }
        assert_eq!(router.absender_lock_anzahl(), 0);

        router.leave(c, &raum).await.unwrap();
        router.disconnect(c).await.unwrap();
        assert_eq!(router.absender_lock_anzahl(), 0);
    }

    #[tokio::test]
    async fn gleichzeitige_publishes_hinterlassen_keine_locks() {
        let (router, _) = router_mit(RouterConfig {
            queue_kapazitaet: 256,
            send_timeout: Duration::from_millis(250),
        });
        let alice = IdentityId::new();
        let c = verbinden(&router, alice);
        let mut rx = router.attach(c);
        let raum = RoomId::from("r");
        router.join(c, &raum).await.unwrap();
        assert!(matches!(rx.recv().await, Some(Delivery::Control { .. })));

        let auftraege: Vec<_> = (0..100)
            .map(|nr| {
                let router = router.clone();
                let raum = raum.clone();
                tokio::spawn(async move { router.publish(&raum, envelope(alice, alice, nr)).await })
            })
            .collect();
        for auftrag in auftraege {
            assert!(auftrag.await.unwrap().vollstaendig());
        }

        let mut empfangen = 0;
        while let Ok(Delivery::Envelope { .. }) = rx.try_recv() {
            empfangen += 1;
        }
        assert_eq!(empfangen, 100);
        assert_eq!(router.absender_lock_anzahl(), 0);
    }

    #[tokio::test]
    async fn disconnect_meldet_left_an_verbleibende() {
        let (router, _) = router_mit(RouterConfig::default());
        let alice = IdentityId::new();
        let bob = IdentityId::new();
        let c1 = verbinden(&router, alice);
        let c2 = verbinden(&router, bob);
        let mut rx1 = router.attach(c1);
        let _rx2 = router.attach(c2);
        let raum = RoomId::from("r");
        router.join(c1, &raum).await.unwrap();
        router.join(c2, &raum).await.unwrap();

        let abgang = router.disconnect(c2).await.unwrap();
        assert_eq!(abgang.rooms, vec![raum.clone()]);
        assert!(!router.ist_angebunden(c2));
        assert!(router.disconnect(c2).await.is_none());

        let mut events = Vec::new();
        while let Ok(Delivery::Control { event, .. }) = rx1.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events.last(),
            Some(&ControlEvent::Left {
                connection_id: c2,
                identity_id: bob,
                reason: LeaveReason::Getrennt,
            })
        );
    }
}
