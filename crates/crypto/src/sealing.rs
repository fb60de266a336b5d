//! Versiegelung privater Schluessel fuer die Ablage
//!
//! Der PKCS#8-DER des privaten Schluessels wird mit AES-256-GCM unter einem
//! aus dem Credential abgeleiteten Schluessel (Argon2id) verschluesselt. Nur
//! diese Form darf an die Persistenz gehen.
//!
//! Die Identitaet ist als AAD gebunden: ein versiegelter Schluessel laesst
//! sich nicht unter einer fremden Identitaet wieder einlagern.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use kurier_core::types::IdentityId;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};
use crate::keypair::PrivateKeyHandle;
use crate::types::SCHLUESSEL_LAENGE;

/// Salt-Laenge fuer die Schluesselableitung
pub const SALT_LAENGE: usize = 16;

const SIEGEL_NONCE_LAENGE: usize = 12;

// ---------------------------------------------------------------------------
// Parameter
// ---------------------------------------------------------------------------

/// Argon2id-Kostenparameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealingParams {
    /// Speicherkosten in KiB
    pub m_cost: u32,
    /// Iterationen
    pub t_cost: u32,
    /// Parallelitaet
    pub p_cost: u32,
}

impl Default for SealingParams {
    /// OWASP-Empfehlung fuer Argon2id (19 MiB, 2 Iterationen)
    fn default() -> Self {
        Self {
            m_cost: 19_456,
            t_cost: 2,
            p_cost: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// SealedPrivateKey
// ---------------------------------------------------------------------------

/// Verschluesselter privater Schluessel, sicher fuer die Ablage
///
/// Enthaelt alles, was zum Entsiegeln ausser dem Credential noetig ist.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedPrivateKey {
    pub salt: [u8; SALT_LAENGE],
    pub nonce: [u8; SIEGEL_NONCE_LAENGE],
    /// AES-GCM Ciphertext inklusive Tag
    pub ciphertext: Vec<u8>,
    pub params: SealingParams,
}

impl std::fmt::Debug for SealedPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedPrivateKey")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("params", &self.params)
            .finish()
    }
}

/// Leitet den Key-Encryption-Key aus dem Credential ab
fn kek_ableiten(
    credential: &[u8],
    salt: &[u8; SALT_LAENGE],
    params: SealingParams,
) -> CryptoResult<Zeroizing<[u8; SCHLUESSEL_LAENGE]>> {
    let argon_params = Params::new(
        params.m_cost,
        params.t_cost,
        params.p_cost,
        Some(SCHLUESSEL_LAENGE),
    )
    .map_err(|e| CryptoError::Intern(format!("Ungueltige Argon2-Parameter: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);
    let mut kek = Zeroizing::new([0u8; SCHLUESSEL_LAENGE]);
    argon2
        .hash_password_into(credential, salt, kek.as_mut_slice())
        .map_err(|e| CryptoError::Intern(format!("Schluesselableitung fehlgeschlagen: {e}")))?;
    Ok(kek)
}

/// Versiegelt einen privaten Schluessel unter dem Credential
pub(crate) fn versiegeln(
    identity_id: IdentityId,
    handle: &PrivateKeyHandle,
    credential: &[u8],
    params: SealingParams,
) -> CryptoResult<SealedPrivateKey> {
    let mut salt = [0u8; SALT_LAENGE];
    let mut nonce = [0u8; SIEGEL_NONCE_LAENGE];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce);

    let kek = kek_ableiten(credential, &salt, params)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek.as_slice()));

    let der = handle.pkcs8_der()?;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: der.as_slice(),
                aad: identity_id.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::Verschluesselung("Versiegelung fehlgeschlagen".into()))?;

    Ok(SealedPrivateKey {
        salt,
        nonce,
        ciphertext,
        params,
    })
}

/// Entsiegelt einen privaten Schluessel
///
/// Falsches Credential, fremde Identitaet oder manipulierte Daten ergeben
/// einheitlich `Unwrap`.
pub(crate) fn entsiegeln(
    identity_id: IdentityId,
    sealed: &SealedPrivateKey,
    credential: &[u8],
) -> CryptoResult<PrivateKeyHandle> {
    let kek = kek_ableiten(credential, &sealed.salt, sealed.params)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek.as_slice()));

    let der = Zeroizing::new(
        cipher
            .decrypt(
                Nonce::from_slice(&sealed.nonce),
                Payload {
                    msg: &sealed.ciphertext,
                    aad: identity_id.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::Unwrap)?,
    );

    PrivateKeyHandle::aus_pkcs8_der(der.as_slice())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::generate_key_pair;

    fn schnelle_params() -> SealingParams {
        SealingParams {
            m_cost: 256,
            t_cost: 1,
            p_cost: 1,
        }
    }

    #[test]
    fn versiegeln_und_entsiegeln() {
        let id = IdentityId::new();
        let (public, handle) = generate_key_pair(2048).unwrap();

        let sealed = versiegeln(id, &handle, b"geheim", schnelle_params()).unwrap();
        let zurueck = entsiegeln(id, &sealed, b"geheim").unwrap();
        assert_eq!(zurueck.public_key().unwrap(), public);
    }

    #[test]
    fn falsches_credential_ist_unwrap_fehler() {
        let id = IdentityId::new();
        let (_, handle) = generate_key_pair(2048).unwrap();

        let sealed = versiegeln(id, &handle, b"richtig", schnelle_params()).unwrap();
        let result = entsiegeln(id, &sealed, b"falsch");
        assert!(matches!(result, Err(CryptoError::Unwrap)));
    }

    #[test]
    fn fremde_identitaet_ist_unwrap_fehler() {
        let (_, handle) = generate_key_pair(2048).unwrap();
        let sealed = versiegeln(IdentityId::new(), &handle, b"pw", schnelle_params()).unwrap();

        let result = entsiegeln(IdentityId::new(), &sealed, b"pw");
        assert!(matches!(result, Err(CryptoError::Unwrap)));
    }

    #[test]
    fn versiegelter_schluessel_ist_serialisierbar() {
        let id = IdentityId::new();
        let (_, handle) = generate_key_pair(2048).unwrap();
        let sealed = versiegeln(id, &handle, b"pw", schnelle_params()).unwrap();

        let json = serde_json::to_string(&sealed).unwrap();
        let zurueck: SealedPrivateKey = serde_json::from_str(&json).unwrap();
        assert_eq!(zurueck, sealed);
        assert!(entsiegeln(id, &zurueck, b"pw").is_ok());
    }

    #[test]
    fn debug_zeigt_keinen_ciphertext() {
        let (_, handle) = generate_key_pair(2048).unwrap();
        let sealed = versiegeln(IdentityId::new(), &handle, b"pw", schnelle_params()).unwrap();
        let text = format!("{sealed:?}");
        assert!(text.contains("ciphertext_len"));
        assert!(!text.contains("salt"));
    }
}
