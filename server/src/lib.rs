//! kurier-server – Bibliotheks-Root
//!
//! Verdrahtet Konfiguration, Schluesselverwahrung und Relay zu einem
//! lauffaehigen Server.

pub mod config;
pub mod logging;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use config::ServerConfig;
use kurier_crypto::{CryptoWorker, KeyCustody};
use kurier_relay::{MemoryArchive, MemoryKeyStore, RelayServer, RelayState, StaticTokenVerifier};
use tokio::sync::watch;

/// Haelt den laufenden Server-Zustand zusammen
pub struct Server {
    pub config: ServerConfig,
}

impl Server {
    /// Erstellt einen neuen Server aus der gegebenen Konfiguration
    pub fn neu(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Baut den gemeinsamen Relay-Zustand aus der Konfiguration
    pub fn zustand_aufbauen(&self) -> Result<Arc<RelayState>> {
        let custody = KeyCustody::neu(self.config.custody_config())?;

        let krypto = &self.config.krypto;
        let zeitlimit = Duration::from_millis(krypto.worker_timeout_ms);
        let parallel = match krypto.worker_parallel {
            0 => std::thread::available_parallelism().map_or(4, |n| n.get()),
            n => n,
        };
        let worker = CryptoWorker::neu(parallel, zeitlimit);

        let tokens = self.config.auth.tokens.clone();
        if tokens.is_empty() {
            tracing::warn!("Keine Auth-Tokens konfiguriert, niemand kann sich anmelden");
        }
        let verifier = StaticTokenVerifier::neu(tokens);
        let archiv = MemoryArchive::neu(self.config.zustellung.archiv_tiefe);
        // Versiegelte Schluessel leben nur so lange wie der Prozess
        let keystore = MemoryKeyStore::neu();

        Ok(RelayState::neu(
            self.config.relay_config(),
            custody,
            worker,
            Arc::new(verifier),
            Arc::new(archiv),
            Arc::new(keystore),
        ))
    }

    /// Startet den Relay und laeuft bis zum Shutdown-Signal (Ctrl-C)
    pub async fn starten(self) -> Result<()> {
        let adresse = self.config.tcp_bind_adresse()?;
        let state = self.zustand_aufbauen()?;

        tracing::info!(
            server_name = %self.config.server.name,
            tcp = %adresse,
            modulus_bits = self.config.krypto.modulus_bits,
            worker = state.worker.verfuegbar(),
            "Server startet"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let relay = RelayServer::neu(Arc::clone(&state), adresse);
        let mut relay_task = tokio::spawn(relay.starten(shutdown_rx));

        tokio::select! {
            ergebnis = tokio::signal::ctrl_c() => {
                ergebnis?;
                tracing::info!("Shutdown-Signal empfangen, Server wird beendet");
                let _ = shutdown_tx.send(true);
                relay_task.await??;
            }
            ergebnis = &mut relay_task => {
                // Relay hat sich ohne Shutdown beendet (z.B. Bind fehlgeschlagen)
                ergebnis??;
            }
        }

        tracing::info!(
            uptime_sek = state.uptime_sek(),
            verbindungen = state.registry.connection_count(),
            "Server beendet"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zustand_aus_standardconfig() {
        let mut config = ServerConfig::default();
        config.krypto.worker_parallel = 3;
        let state = Server::neu(config).zustand_aufbauen().unwrap();
        assert_eq!(state.worker.verfuegbar(), 3);
        assert_eq!(state.config.router.queue_kapazitaet, 64);
        assert_eq!(state.registry.connection_count(), 0);
    }

    #[test]
    fn zu_kleiner_modulus_wird_abgelehnt() {
        let mut config = ServerConfig::default();
        config.krypto.modulus_bits = 1024;
        assert!(Server::neu(config).zustand_aufbauen().is_err());
    }
}
