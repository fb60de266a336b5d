//! Server-Konfiguration (TOML)
//!
//! Jede Sektion ist optional. Fehlende Felder und eine fehlende Datei fallen
//! auf die Standardwerte zurueck.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use kurier_core::types::IdentityId;
use kurier_crypto::{CustodyConfig, SealingParams, MIN_MODULUS_BITS};
use kurier_protocol::wire::DEFAULT_MAX_FRAME_SIZE;
use kurier_relay::registry::DEFAULT_GETRENNT_TTL;
use kurier_relay::{RelayConfig, RouterConfig, DEFAULT_MAX_HISTORY};
use serde::{Deserialize, Serialize};

/// Vollstaendige Server-Konfiguration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerEinstellungen,
    pub netzwerk: NetzwerkEinstellungen,
    /// Schluesselverwahrung und Krypto-Worker
    pub krypto: KryptoEinstellungen,
    /// Send-Queues und Archiv
    pub zustellung: ZustellungsEinstellungen,
    pub logging: LoggingEinstellungen,
    /// Statische Bearer-Tokens
    pub auth: AuthEinstellungen,
}

/// Allgemeine Server-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerEinstellungen {
    /// Anzeigename des Servers
    pub name: String,
}

impl Default for ServerEinstellungen {
    fn default() -> Self {
        Self {
            name: "Kurier Relay".into(),
        }
    }
}

/// Netzwerk-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetzwerkEinstellungen {
    pub bind_adresse: String,
    pub tcp_port: u16,
    pub max_verbindungen: usize,
    /// Maximale Frame-Groesse in Bytes
    pub max_frame_bytes: usize,
    pub hello_timeout_sek: u64,
    pub leerlauf_timeout_sek: u64,
}

impl Default for NetzwerkEinstellungen {
    fn default() -> Self {
        Self {
            bind_adresse: "0.0.0.0".into(),
            tcp_port: 7420,
            max_verbindungen: 512,
            max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
            hello_timeout_sek: 10,
            leerlauf_timeout_sek: 90,
        }
    }
}

/// Krypto-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KryptoEinstellungen {
    /// RSA-Modulus fuer neue Schluesselpaare (mindestens 2048)
    pub modulus_bits: usize,
    /// Schluesselpaar fuer unbekannte Identitaeten bei der Anmeldung erzeugen
    pub schluessel_bei_anmeldung: bool,
    /// Gleichzeitige Krypto-Jobs (0 = Anzahl CPU-Kerne)
    pub worker_parallel: usize,
    pub worker_timeout_ms: u64,
    /// Argon2id-Parameter fuer versiegelte Schluessel
    pub argon2: SealingParams,
}

impl Default for KryptoEinstellungen {
    fn default() -> Self {
        Self {
            modulus_bits: MIN_MODULUS_BITS,
            schluessel_bei_anmeldung: true,
            worker_parallel: 0,
            worker_timeout_ms: 5_000,
            argon2: SealingParams::default(),
        }
    }
}

/// Zustellungs-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZustellungsEinstellungen {
    /// Groesse der Send-Queue pro Verbindung
    pub queue_kapazitaet: usize,
    pub send_timeout_ms: u64,
    /// Anzahl archivierter Envelopes pro Raum
    pub archiv_tiefe: usize,
    /// Hoechstzahl Envelopes pro `History`-Anfrage
    pub max_history: usize,
    /// Wie lange getrennte Empfaenger als `Disconnected` quittiert werden
    pub getrennt_ttl_sek: u64,
}

impl Default for ZustellungsEinstellungen {
    fn default() -> Self {
        let router = RouterConfig::default();
        Self {
            queue_kapazitaet: router.queue_kapazitaet,
            send_timeout_ms: router.send_timeout.as_millis() as u64,
            archiv_tiefe: 1000,
            max_history: DEFAULT_MAX_HISTORY,
            getrennt_ttl_sek: DEFAULT_GETRENNT_TTL.as_secs(),
        }
    }
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Log-Level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Format: "json" oder "text"
    pub format: String,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Auth-Einstellungen
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthEinstellungen {
    /// Bearer-Token -> Identitaet
    pub tokens: HashMap<String, IdentityId>,
}

impl ServerConfig {
    /// Liest `pfad`; existiert die Datei nicht, gelten die Standardwerte
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(pfad) {
            Ok(inhalt) => {
                let config: Self = toml::from_str(&inhalt)
                    .map_err(|e| anyhow::anyhow!("Konfigurationsfehler in '{pfad}': {e}"))?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Keine Konfigurationsdatei, Relay startet mit Standardwerten"
                );
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Konfigurationsdatei '{pfad}' nicht lesbar: {e}"
            )),
        }
    }

    /// Gibt die Bind-Adresse fuer den Relay zurueck
    pub fn tcp_bind_adresse(&self) -> anyhow::Result<SocketAddr> {
        let adresse = format!("{}:{}", self.netzwerk.bind_adresse, self.netzwerk.tcp_port);
        adresse
            .parse()
            .map_err(|e| anyhow::anyhow!("Ungueltige Bind-Adresse '{adresse}': {e}"))
    }

    pub fn custody_config(&self) -> CustodyConfig {
        CustodyConfig {
            modulus_bits: self.krypto.modulus_bits,
            sealing: self.krypto.argon2,
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            max_verbindungen: self.netzwerk.max_verbindungen,
            max_frame_bytes: self.netzwerk.max_frame_bytes,
            hello_timeout: Duration::from_secs(self.netzwerk.hello_timeout_sek),
            leerlauf_timeout: Duration::from_secs(self.netzwerk.leerlauf_timeout_sek),
            schluessel_bei_anmeldung: self.krypto.schluessel_bei_anmeldung,
            getrennt_ttl: Duration::from_secs(self.zustellung.getrennt_ttl_sek),
            max_history: self.zustellung.max_history,
            router: RouterConfig {
                queue_kapazitaet: self.zustellung.queue_kapazitaet,
                send_timeout: Duration::from_millis(self.zustellung.send_timeout_ms),
            },
        }
    }
}
