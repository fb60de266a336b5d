//! Gemeinsamer Relay-Zustand
//!
//! Haelt alle geteilten Services als Arc-Referenzen, die sicher zwischen
//! tokio-Tasks geteilt werden koennen.

use kurier_crypto::{CryptoWorker, KeyCustody};
use kurier_protocol::wire::DEFAULT_MAX_FRAME_SIZE;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::archive::EnvelopeArchive;
use crate::auth::IdentityVerifier;
use crate::keys::{KeySessions, KeyStore};
use crate::registry::{SessionRegistry, DEFAULT_GETRENNT_TTL};
use crate::router::{DeliveryRouter, RouterConfig};

/// Standard-Obergrenze fuer `History`-Anfragen
pub const DEFAULT_MAX_HISTORY: usize = 100;

/// Konfiguration fuer den Relay
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximale gleichzeitige Verbindungen
    pub max_verbindungen: usize,
    /// Maximale Frame-Groesse in Bytes
    pub max_frame_bytes: usize,
    /// Frist fuer den `Hello`-Frame nach dem Verbindungsaufbau
    pub hello_timeout: Duration,
    /// Verbindung wird nach dieser Zeit ohne eingehenden Frame getrennt
    pub leerlauf_timeout: Duration,
    /// Unbekannte Identitaeten erhalten bei der Anmeldung ein Schluesselpaar
    pub schluessel_bei_anmeldung: bool,
    /// Wie lange getrennte Empfaenger als `Disconnected` quittiert werden
    pub getrennt_ttl: Duration,
    /// Obergrenze fuer `History`-Anfragen
    pub max_history: usize,
    pub router: RouterConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_verbindungen: 512,
            max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
            hello_timeout: Duration::from_secs(10),
            leerlauf_timeout: Duration::from_secs(90),
            schluessel_bei_anmeldung: true,
            getrennt_ttl: DEFAULT_GETRENNT_TTL,
            max_history: DEFAULT_MAX_HISTORY,
            router: RouterConfig::default(),
        }
    }
}

/// Gemeinsamer Relay-Zustand (thread-safe, Arc-geteilt)
pub struct RelayState {
    pub config: Arc<RelayConfig>,
    /// Live-Verbindungen und Raum-Mitgliedschaften
    pub registry: SessionRegistry,
    /// Send-Queues und Fanout
    pub router: DeliveryRouter,
    /// Schluesselverwahrung (Public-Key-Verzeichnis)
    pub custody: KeyCustody,
    /// Worker fuer blockierende Krypto-Arbeit
    pub worker: CryptoWorker,
    /// Versiegelte Schluessel, resident nur waehrend einer Sitzung
    pub keys: KeySessions,
    pub verifier: Arc<dyn IdentityVerifier>,
    /// Startzeitpunkt (fuer Uptime)
    pub start_time: Instant,
}

impl RelayState {
    pub fn neu(
        config: RelayConfig,
        custody: KeyCustody,
        worker: CryptoWorker,
        verifier: Arc<dyn IdentityVerifier>,
        archive: Arc<dyn EnvelopeArchive>,
        keystore: Arc<dyn KeyStore>,
    ) -> Arc<Self> {
        let registry = SessionRegistry::mit_getrennt_ttl(config.getrennt_ttl);
        let router = DeliveryRouter::neu(registry.clone(), archive, config.router);
        let keys = KeySessions::neu(
            custody.clone(),
            worker.clone(),
            keystore,
            registry.clone(),
            config.schluessel_bei_anmeldung,
        );
        Arc::new(Self {
            config: Arc::new(config),
            registry,
            router,
            custody,
            worker,
            keys,
            verifier,
            start_time: Instant::now(),
        })
    }

    /// Uptime in Sekunden
    pub fn uptime_sek(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
