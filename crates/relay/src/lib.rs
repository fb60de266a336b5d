//! kurier-relay – Raum-Fanout fuer verschluesselte Envelopes
//!
//! Der Relay nimmt Envelopes entgegen und verteilt sie an alle aktuellen
//! Mitglieder eines Raums, ohne je Klartext zu sehen.
//!
//! ## Architektur
//!
//! ```text
//! TCP Listener (RelayServer)
//!     |
//!     v
//! RelayConnection (Lese-Task + Schreib-Task pro Verbindung)
//!     |  Hello -> IdentityVerifier -> SessionRegistry::connect
//!     |        -> KeySessions::oeffnen (KeyStore -> KeyCustody)
//!     |
//!     v
//! DeliveryRouter
//!     +-- SessionRegistry  (Verbindungen, Raum-Mitgliedschaften)
//!     +-- Send-Queues      (eine pro Verbindung, begrenzt)
//!     +-- EnvelopeArchive  (Ciphertext an die Persistenz)
//! ```

pub mod archive;
pub mod auth;
pub mod connection;
pub mod error;
pub mod keys;
pub mod registry;
pub mod router;
pub mod state;
pub mod tcp;

// Bequeme Re-Exporte
pub use archive::{ArchivedEnvelope, EnvelopeArchive, MemoryArchive};
pub use auth::{IdentityVerifier, StaticTokenVerifier};
pub use connection::RelayConnection;
pub use error::{RelayError, RelayResult};
pub use keys::{KeySessions, KeyStore, MemoryKeyStore, StoredKey};
pub use registry::{Departure, FanoutSnapshot, SessionRegistry};
pub use router::{Delivery, DeliveryRouter, RouterConfig};
pub use state::{RelayConfig, RelayState, DEFAULT_MAX_HISTORY};
pub use tcp::RelayServer;
