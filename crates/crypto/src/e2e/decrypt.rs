//! Entschluesselung eines Envelopes
//!
//! Entschluesselung und Tag-Pruefung sind eine atomare Operation: bei
//! falschem Tag wird kein Teil des Klartexts herausgegeben.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use kurier_protocol::envelope::Envelope;
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::types::SymmetricKey;

/// Entschluesselt den Ciphertext eines Envelopes mit dem entpackten Schluessel
///
/// Verifiziert Auth-Tag und, falls gebunden, die Metadaten als AAD.
pub(crate) fn entschluesseln(key: &SymmetricKey, envelope: &Envelope) -> CryptoResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let aad = envelope.aad();
    let aad: &[u8] = aad.as_ref().map(|a| a.as_slice()).unwrap_or(&[]);

    let mut buffer = envelope.ciphertext.clone();
    let ergebnis = cipher.decrypt_in_place_detached(
        Nonce::from_slice(&envelope.nonce),
        aad,
        &mut buffer,
        Tag::from_slice(&envelope.auth_tag),
    );

    match ergebnis {
        Ok(()) => Ok(buffer),
        Err(_) => {
            buffer.zeroize();
            Err(CryptoError::Authentifizierung)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
