//! E2E Verschluesselung (End-to-End)
//!
//! Client <-> Client Verschluesselung. Der Relay forwardet Envelopes blind
//! und kann den Inhalt nicht entschluesseln.
//!
//! ## Ablauf
//! 1. Absender holt den Public Key des Empfaengers aus der `KeyCustody`
//! 2. `EnvelopeCodec::encrypt` erzeugt Einmal-Schluessel, Nonce und Ciphertext
//! 3. Der Einmal-Schluessel wird mit RSA-OAEP fuer den Empfaenger eingewickelt
//! 4. Der Empfaenger entpackt den Schluessel ueber seine `KeyCustody`
//!    und verifiziert den GCM-Tag vor der Herausgabe des Klartexts

pub mod decrypt;
pub mod encrypt;

use kurier_core::types::IdentityId;
use kurier_protocol::envelope::{Envelope, EnvelopeHeader, SealedPayload};

use crate::custody::KeyCustody;
use crate::error::{CryptoError, CryptoResult};
use crate::types::PublicKey;

/// Standard-Limit fuer Klartexte (1 MiB)
pub const DEFAULT_MAX_PLAINTEXT_BYTES: usize = 1024 * 1024;

/// Limits und Modus des Codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    pub max_plaintext_bytes: usize,
    /// Bindet Absender, Empfaenger und Zeitstempel als AAD (`verpacken`)
    pub bind_metadata: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_plaintext_bytes: DEFAULT_MAX_PLAINTEXT_BYTES,
            bind_metadata: true,
        }
    }
}

/// Hybride Ver- und Entschluesselung von Envelopes
///
/// Haelt nur Limits, sonst zustandslos.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec {
    config: CodecConfig,
}

impl EnvelopeCodec {
    pub fn neu(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Verschluesselt ohne Metadaten-Bindung
    ///
    /// Zu grosse Klartexte werden vor jeder Krypto-Arbeit abgelehnt.
    pub fn encrypt(&self, receiver: &PublicKey, plaintext: &[u8]) -> CryptoResult<SealedPayload> {
        self.groesse_pruefen(plaintext)?;
        encrypt::verschluesseln(receiver, plaintext, &[])
    }

    /// Verschluesselt und bindet `header` als AAD an den Ciphertext
    pub fn encrypt_bound(
        &self,
        receiver: &PublicKey,
        plaintext: &[u8],
        header: EnvelopeHeader,
    ) -> CryptoResult<Envelope> {
        self.groesse_pruefen(plaintext)?;
        let mut envelope = encrypt::verschluesseln(receiver, plaintext, &header.aad())?.address(header);
        envelope.metadata_bound = true;
        Ok(envelope)
    }

    /// Baut ein vollstaendiges Envelope im konfigurierten Modus
    pub fn verpacken(
        &self,
        receiver: &PublicKey,
        plaintext: &[u8],
        header: EnvelopeHeader,
    ) -> CryptoResult<Envelope> {
        if self.config.bind_metadata {
            self.encrypt_bound(receiver, plaintext, header)
        } else {
            Ok(self.encrypt(receiver, plaintext)?.address(header))
        }
    }

    /// Entschluesselt ein Envelope fuer `receiver`
    ///
    /// Fehler beim Entpacken des Schluessels werden als `Unwrap`
    /// weitergereicht, ein falscher Tag ergibt `Authentifizierung`.
    /// Der Klartext wird erst nach erfolgreicher Verifikation herausgegeben.
    pub fn decrypt(
        &self,
        custody: &KeyCustody,
        receiver: IdentityId,
        envelope: &Envelope,
    ) -> CryptoResult<Vec<u8>> {
        let key = custody.decrypt_wrapped_key(receiver, &envelope.wrapped_key)?;

        decrypt::entschluesseln(&key, envelope).map_err(|e| {
            tracing::warn!(
                receiver = %receiver,
                sender = %envelope.sender_id,
                "Envelope-Authentifizierung fehlgeschlagen"
            );
            e
        })
    }

    fn groesse_pruefen(&self, plaintext: &[u8]) -> CryptoResult<()> {
        if plaintext.len() > self.config.max_plaintext_bytes {
            return Err(CryptoError::PlaintextZuGross {
                groesse: plaintext.len(),
                maximum: self.config.max_plaintext_bytes,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
