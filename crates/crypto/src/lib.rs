//! # kurier-crypto
//!
//! Hybride Envelope-Verschluesselung und Schluesselverwahrung fuer Kurier.
//!
//! ## Module
//! - `custody` - RSA-Schluesselpaare pro Identitaet (KeyCustody)
//! - `e2e` - Envelope-Ver-/Entschluesselung (RSA-OAEP + AES-256-GCM)
//! - `keypair` - Schluesselerzeugung, opakes Private-Key-Handle
//! - `sealing` - Versiegelung privater Schluessel fuer die Ablage
//! - `pool` - Begrenzter Worker fuer blockierende Krypto-Arbeit
//! - `types` - Gemeinsame Typen (SymmetricKey, PublicKey)
//! - `error` - Fehlertypen

pub mod custody;
pub mod e2e;
pub mod error;
pub mod keypair;
pub mod pool;
pub mod sealing;
pub mod types;

// Bequeme Re-Exports
pub use custody::{CustodyConfig, KeyCustody};
pub use e2e::{CodecConfig, EnvelopeCodec, DEFAULT_MAX_PLAINTEXT_BYTES};
pub use error::{CryptoError, CryptoResult};
pub use keypair::{generate_key_pair, PrivateKeyHandle};
pub use pool::CryptoWorker;
pub use sealing::{SealedPrivateKey, SealingParams};
pub use types::{PublicKey, SymmetricKey, MIN_MODULUS_BITS};
