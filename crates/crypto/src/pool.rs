//! Begrenzter Worker fuer Krypto-Operationen
//!
//! RSA- und AES-Arbeit laeuft ueber `spawn_blocking`, damit die
//! Verbindungs-Tasks den Runtime-Thread nicht blockieren. Ein Semaphore
//! begrenzt die Zahl paralleler Operationen.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::{CryptoError, CryptoResult};

/// Standard-Zeitlimit pro Operation
pub const DEFAULT_ZEITLIMIT: Duration = Duration::from_secs(5);

/// Worker-Pool fuer blockierende Krypto-Arbeit
///
/// Clone teilt das Semaphore.
#[derive(Debug, Clone)]
pub struct CryptoWorker {
    semaphore: Arc<Semaphore>,
    zeitlimit: Duration,
}

impl CryptoWorker {
    /// Erstellt einen Worker mit `max_parallel` gleichzeitigen Operationen
    pub fn neu(max_parallel: usize, zeitlimit: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_parallel.max(1))),
            zeitlimit,
        }
    }

    /// Freie Slots
    pub fn verfuegbar(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Fuehrt `arbeit` auf dem Blocking-Pool aus
    ///
    /// Gibt `Abgebrochen` zurueck, sobald `cancel` ausgeloest wird, und
    /// `Zeitlimit` wenn die Operation laenger als das Zeitlimit dauert. Das
    /// Ergebnis einer abgebrochenen Operation wird verworfen.
    pub async fn ausfuehren<T, F>(&self, cancel: &CancellationToken, arbeit: F) -> CryptoResult<T>
    where
        F: FnOnce() -> CryptoResult<T> + Send + 'static,
        T: Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(CryptoError::Abgebrochen);
        }

        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(CryptoError::Abgebrochen),
            permit = self.semaphore.clone().acquire_owned() => permit
                .map_err(|_| CryptoError::Intern("Krypto-Worker geschlossen".into()))?,
        };

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            arbeit()
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Krypto-Operation abgebrochen");
                Err(CryptoError::Abgebrochen)
            }
            ergebnis = tokio::time::timeout(self.zeitlimit, handle) => match ergebnis {
                Ok(Ok(ergebnis)) => ergebnis,
                Ok(Err(e)) => Err(CryptoError::Intern(format!("Krypto-Task fehlgeschlagen: {e}"))),
                Err(_) => {
                    tracing::warn!(zeitlimit_ms = self.zeitlimit.as_millis() as u64, "Krypto-Operation Zeitlimit");
                    Err(CryptoError::Zeitlimit)
                }
            },
        }
    }
}

impl Default for CryptoWorker {
    fn default() -> Self {
        let parallel = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::neu(parallel, DEFAULT_ZEITLIMIT)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
