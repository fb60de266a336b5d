//! Hybride Verschluesselung eines Payloads
//!
//! Pro Aufruf ein frischer 256-Bit-Schluessel und eine frische 96-Bit-Nonce
//! aus dem OS-Zufallsgenerator. Der Klartext wird mit AES-256-GCM
//! verschluesselt, der Schluessel mit RSA-OAEP-SHA256 fuer den Empfaenger
//! eingewickelt.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use kurier_protocol::envelope::{SealedPayload, NONCE_LAENGE, TAG_LAENGE};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::Oaep;
use sha2::Sha256;

use crate::error::{CryptoError, CryptoResult};
use crate::types::{PublicKey, SymmetricKey};

/// Verschluesselt `plaintext` fuer den Inhaber von `receiver`
///
/// `aad` wird mitauthentifiziert, aber nicht verschluesselt. Groessenlimits
/// prueft der Aufrufer.
pub(crate) fn verschluesseln(
    receiver: &PublicKey,
    plaintext: &[u8],
    aad: &[u8],
) -> CryptoResult<SealedPayload> {
    let key = SymmetricKey::generieren();
    let mut nonce = [0u8; NONCE_LAENGE];
    OsRng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let mut ciphertext = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, &mut ciphertext)
        .map_err(|e| CryptoError::Verschluesselung(e.to_string()))?;

    let mut auth_tag = [0u8; TAG_LAENGE];
    auth_tag.copy_from_slice(&tag);

    let wrapped_key = receiver
        .rsa()
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key.as_bytes())
        .map_err(|e| CryptoError::Verschluesselung(format!("Key-Wrapping fehlgeschlagen: {e}")))?;

    Ok(SealedPayload {
        wrapped_key,
        nonce,
        ciphertext,
        auth_tag,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::generate_key_pair;

    #[test]
    fn ciphertext_hat_klartextlaenge_und_separaten_tag() {
        let (public, _) = generate_key_pair(2048).unwrap();
        let plaintext = b"Hallo Bob, hier ist Alice";

        let sealed = verschluesseln(&public, plaintext, &[]).unwrap();

        assert_eq!(sealed.ciphertext.len(), plaintext.len());
        assert_ne!(sealed.ciphertext.as_slice(), plaintext.as_slice());
        // RSA-2048: Wrapped Key hat Modulus-Laenge
        assert_eq!(sealed.wrapped_key.len(), 256);
    }

    #[test]
    fn leerer_klartext_ist_erlaubt() {
        let (public, _) = generate_key_pair(2048).unwrap();
        let sealed = verschluesseln(&public, &[], &[]).unwrap();
        assert!(sealed.ciphertext.is_empty());
    }

    #[test]
    fn zwei_aufrufe_unterscheiden_sich() {
        let (public, _) = generate_key_pair(2048).unwrap();
        let a = verschluesseln(&public, b"gleich", &[]).unwrap();
        let b = verschluesseln(&public, b"gleich", &[]).unwrap();

        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.wrapped_key, b.wrapped_key);
        assert_ne!(a.ciphertext, b.ciphertext);
    }
}
