//! Schluessel-Sitzungen – private Schluessel nur waehrend einer Sitzung
//!
//! Ein privater Schluessel liegt im Ruhezustand nur versiegelt im
//! [`KeyStore`]. Bei der Anmeldung wird er mit dem Credential aus `Hello`
//! entsiegelt und in der `KeyCustody` resident. Trennt sich die letzte
//! Verbindung der Identitaet, wird er wieder entladen.
//!
//! Unbekannte Identitaeten erhalten (falls konfiguriert) bei der ersten
//! Anmeldung ein Schluesselpaar. Die versiegelte Form geht sofort an den
//! Store, bevor die Sitzung beginnt.
//!
//! Die Krypto-Arbeit laeuft im `CryptoWorker` und ist an das
//! Cancellation-Token der Verbindung gebunden. Wird ein Entsiegeln
//! abgebrochen, waehrend der Blocking-Task noch laeuft, entlaedt der Task
//! den Schluessel selbst, sofern die Identitaet inzwischen offline ist.

use dashmap::DashMap;
use kurier_core::types::IdentityId;
use kurier_crypto::{CryptoError, CryptoWorker, KeyCustody, PublicKey, SealedPrivateKey};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::error::RelayResult;
use crate::registry::SessionRegistry;

// ---------------------------------------------------------------------------
// KeyStore
// ---------------------------------------------------------------------------

/// Versiegelter Schluessel einer Identitaet, wie er abgelegt wird
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredKey {
    pub public_key: PublicKey,
    pub sealed: SealedPrivateKey,
}

/// Persistenz fuer versiegelte Schluessel
///
/// Sieht nie unversiegeltes Schluesselmaterial. Wird aus dem Blocking-Pool
/// des `CryptoWorker` aufgerufen.
pub trait KeyStore: Send + Sync + 'static {
    fn laden(&self, identity_id: IdentityId) -> Option<StoredKey>;

    fn speichern(&self, identity_id: IdentityId, key: StoredKey);
}

/// In-Memory-Store (Tests und Einzelprozess-Betrieb)
#[derive(Default)]
pub struct MemoryKeyStore {
    eintraege: DashMap<IdentityId, StoredKey>,
}

impl MemoryKeyStore {
    pub fn neu() -> Self {
        Self::default()
    }

    pub fn anzahl(&self) -> usize {
        self.eintraege.len()
    }
}

impl KeyStore for MemoryKeyStore {
    fn laden(&self, identity_id: IdentityId) -> Option<StoredKey> {
        self.eintraege.get(&identity_id).map(|e| e.value().clone())
    }

    fn speichern(&self, identity_id: IdentityId, key: StoredKey) {
        self.eintraege.insert(identity_id, key);
    }
}

// ---------------------------------------------------------------------------
// KeySessions
// ---------------------------------------------------------------------------

/// Oeffnet und schliesst Schluessel-Sitzungen pro Identitaet
///
/// Clone teilt den inneren Zustand.
#[derive(Clone)]
pub struct KeySessions {
    inner: Arc<SessionsInner>,
}

struct SessionsInner {
    custody: KeyCustody,
    worker: CryptoWorker,
    store: Arc<dyn KeyStore>,
    registry: SessionRegistry,
    /// Serialisiert Oeffnen und Schliessen derselben Identitaet
    locks: DashMap<IdentityId, Arc<Mutex<()>>>,
    provisionieren: bool,
}

impl KeySessions {
    pub fn neu(
        custody: KeyCustody,
        worker: CryptoWorker,
        store: Arc<dyn KeyStore>,
        registry: SessionRegistry,
        provisionieren: bool,
    ) -> Self {
        Self {
            inner: Arc::new(SessionsInner {
                custody,
                worker,
                store,
                registry,
                locks: DashMap::new(),
                provisionieren,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyStore> {
        &self.inner.store
    }

    /// Macht den privaten Schluessel der Identitaet resident
    ///
    /// Reihenfolge: bereits resident, versiegelte Kopie im Store, neues
    /// Schluesselpaar (nur mit Provisionierung). Eine Identitaet ohne
    /// Schluessel ist kein Fehler; `Decrypt` liefert dann `NOT_FOUND`.
    /// Ein falsches Credential ergibt `Unwrap`.
    pub async fn oeffnen(
        &self,
        identity_id: IdentityId,
        credential: &str,
        cancel: &CancellationToken,
    ) -> RelayResult<()> {
        let lock = self.lock(identity_id);
        let sitzung = lock.lock().await;

        let ergebnis = self.oeffnen_gesperrt(identity_id, credential, cancel).await;

        drop(sitzung);
        drop(lock);
        self.lock_freigeben(identity_id);
        ergebnis
    }

    async fn oeffnen_gesperrt(
        &self,
        identity_id: IdentityId,
        credential: &str,
        cancel: &CancellationToken,
    ) -> RelayResult<()> {
        let custody = &self.inner.custody;
        if custody.ist_resident(identity_id) {
            return Ok(());
        }

        let credential = Zeroizing::new(credential.as_bytes().to_vec());
        let custody = custody.clone();
        let registry = self.inner.registry.clone();
        let abbruch = cancel.clone();

        if let Some(gespeichert) = self.inner.store.laden(identity_id) {
            self.inner
                .worker
                .ausfuehren(cancel, move || {
                    custody.unseal_into(
                        identity_id,
                        &gespeichert.public_key,
                        &gespeichert.sealed,
                        &credential,
                    )?;
                    verwaisten_schluessel_entladen(&custody, &registry, &abbruch, identity_id);
                    Ok(())
                })
                .await?;
            tracing::info!(identity = %identity_id, "Privater Schluessel entsiegelt");
            return Ok(());
        }

        if !self.inner.provisionieren || custody.ist_registriert(identity_id) {
            return Ok(());
        }

        let store = Arc::clone(&self.inner.store);
        let ergebnis = self
            .inner
            .worker
            .ausfuehren(cancel, move || {
                let public_key = custody.register(identity_id)?;
                let sealed = custody.seal(identity_id, &credential)?;
                store.speichern(identity_id, StoredKey { public_key, sealed });
                verwaisten_schluessel_entladen(&custody, &registry, &abbruch, identity_id);
                Ok(())
            })
            .await;

        match ergebnis {
            Ok(()) => {
                tracing::info!(identity = %identity_id, "Schluesselpaar erzeugt und versiegelt abgelegt");
                Ok(())
            }
            // Parallel ueber die API registriert
            Err(CryptoError::BereitsRegistriert(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Entlaedt den privaten Schluessel, falls die Identitaet offline ist
    ///
    /// Gibt `true` zurueck, wenn ein Schluessel entladen wurde.
    pub async fn schliessen(&self, identity_id: IdentityId) -> bool {
        let lock = self.lock(identity_id);
        let sitzung = lock.lock().await;

        let entladen =
            !self.inner.registry.ist_online(identity_id) && self.inner.custody.evict(identity_id);

        drop(sitzung);
        drop(lock);
        self.lock_freigeben(identity_id);

        if entladen {
            tracing::info!(identity = %identity_id, "Sitzung beendet, privater Schluessel entladen");
        }
        entladen
    }

    fn lock(&self, identity_id: IdentityId) -> Arc<Mutex<()>> {
        self.inner.locks.entry(identity_id).or_default().clone()
    }

    fn lock_freigeben(&self, identity_id: IdentityId) {
        self.inner
            .locks
            .remove_if(&identity_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Laeuft im Blocking-Task: wurde die Anmeldung inzwischen abgebrochen und
/// ist die Identitaet offline, darf der Schluessel nicht resident bleiben
fn verwaisten_schluessel_entladen(
    custody: &KeyCustody,
    registry: &SessionRegistry,
    abbruch: &CancellationToken,
    identity_id: IdentityId,
) {
    if abbruch.is_cancelled() && !registry.ist_online(identity_id) && custody.evict(identity_id) {
        tracing::debug!(identity = %identity_id, "Abgebrochene Anmeldung, Schluessel entladen");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
