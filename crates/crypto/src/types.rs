//! Gemeinsame Typen fuer das Kryptografie-Subsystem

use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};

/// Laenge des symmetrischen Schluessels (AES-256)
pub const SCHLUESSEL_LAENGE: usize = 32;

/// Minimale RSA-Modulus-Groesse in Bit
pub const MIN_MODULUS_BITS: usize = 2048;

/// Oeffentlicher Exponent fuer alle erzeugten Schluessel
pub const OEFFENTLICHER_EXPONENT: u32 = 65537;

// ---------------------------------------------------------------------------
// SymmetricKey
// ---------------------------------------------------------------------------

/// Einmal-Schluessel fuer genau ein Envelope (wird beim Drop genullt)
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; SCHLUESSEL_LAENGE]);

impl SymmetricKey {
    /// Erzeugt einen frischen Schluessel aus dem OS-Zufallsgenerator
    pub fn generieren() -> Self {
        let mut bytes = [0u8; SCHLUESSEL_LAENGE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Uebernimmt entpacktes Schluesselmaterial; Laenge muss exakt stimmen
    pub(crate) fn aus_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; SCHLUESSEL_LAENGE] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; SCHLUESSEL_LAENGE] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey([REDACTED] {} bytes)", SCHLUESSEL_LAENGE)
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SymmetricKey {}

// ---------------------------------------------------------------------------
// PublicKey
// ---------------------------------------------------------------------------

/// RSA-Public-Key, kodiert als DER SubjectPublicKeyInfo
#[derive(Clone)]
pub struct PublicKey {
    der: Vec<u8>,
    key: RsaPublicKey,
}

impl PublicKey {
    /// Parst einen DER-kodierten SubjectPublicKeyInfo
    ///
    /// Lehnt Schluessel unter [`MIN_MODULUS_BITS`] ab.
    pub fn from_der(der: &[u8]) -> CryptoResult<Self> {
        let key = RsaPublicKey::from_public_key_der(der)
            .map_err(|e| CryptoError::Verschluesselung(format!("Ungueltiger Public Key: {e}")))?;
        Self::aus_rsa(key)
    }

    pub(crate) fn aus_rsa(key: RsaPublicKey) -> CryptoResult<Self> {
        let bits = key.size() * 8;
        if bits < MIN_MODULUS_BITS {
            return Err(CryptoError::Verschluesselung(format!(
                "Public Key zu kurz: {bits} Bit (Minimum: {MIN_MODULUS_BITS})"
            )));
        }
        let der = key
            .to_public_key_der()
            .map_err(|e| CryptoError::Intern(format!("DER-Kodierung fehlgeschlagen: {e}")))?
            .as_bytes()
            .to_vec();
        Ok(Self { der, key })
    }

    /// DER-Bytes fuer Verzeichnis und Transport
    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    /// Modulus-Groesse in Bit
    pub fn modulus_bits(&self) -> usize {
        self.key.size() * 8
    }

    pub(crate) fn rsa(&self) -> &RsaPublicKey {
        &self.key
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for PublicKey {}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey(RSA-{})", self.modulus_bits())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetrische_schluessel_sind_verschieden() {
        assert_ne!(SymmetricKey::generieren(), SymmetricKey::generieren());
    }

    #[test]
    fn debug_zeigt_kein_schluesselmaterial() {
        let key = SymmetricKey::generieren();
        assert_eq!(format!("{key:?}"), "SymmetricKey([REDACTED] 32 bytes)");
    }

    #[test]
    fn zeroize_nullt_schluesselmaterial() {
        let mut key = SymmetricKey::generieren();
        assert_ne!(key.as_bytes(), &[0u8; SCHLUESSEL_LAENGE]);
        key.zeroize();
        assert_eq!(key.as_bytes(), &[0u8; SCHLUESSEL_LAENGE]);
    }

    #[test]
    fn aus_slice_prueft_laenge() {
        assert!(SymmetricKey::aus_slice(&[0u8; 31]).is_none());
        assert!(SymmetricKey::aus_slice(&[0u8; 33]).is_none());
        assert!(SymmetricKey::aus_slice(&[0u8; 32]).is_some());
    }

    #[test]
    fn kaputter_public_key_wird_abgelehnt() {
        let result = PublicKey::from_der(b"kein DER");
        assert!(matches!(result, Err(CryptoError::Verschluesselung(_))));
    }
}
