//! RSA-Schluesselpaare der Parteien
//!
//! Der oeffentliche Teil wird frei weitergegeben, der private Teil steckt in
//! einem opaken [`PrivateKeyHandle`]. Ausserhalb dieses Crates gibt es keinen
//! Zugriff auf das Schluesselmaterial; das Handle ist eine Faehigkeit, kein Wert.

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::{BigUint, Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};
use crate::types::{PublicKey, SymmetricKey, MIN_MODULUS_BITS, OEFFENTLICHER_EXPONENT};

/// Opakes Handle auf einen privaten RSA-Schluessel
///
/// Klonen teilt denselben Schluessel (read-only, `Arc`). Die RSA-Operationen
/// nehmen `&self` und koennen daher parallel ohne weiteres Locking laufen.
#[derive(Clone)]
pub struct PrivateKeyHandle(Arc<RsaPrivateKey>);

impl PrivateKeyHandle {
    /// Oeffentlicher Schluessel zu diesem Handle
    pub(crate) fn public_key(&self) -> CryptoResult<PublicKey> {
        PublicKey::aus_rsa(RsaPublicKey::from(self.0.as_ref()))
    }

    /// Entpackt einen RSA-OAEP-SHA256 Wrapped Key
    ///
    /// Jeder Fehler (falsches Padding, falscher Schluessel, falsche Laenge)
    /// ergibt `Unwrap`, ohne Details preiszugeben.
    pub(crate) fn unwrap_key(&self, wrapped_key: &[u8]) -> CryptoResult<SymmetricKey> {
        let bytes = Zeroizing::new(
            self.0
                .decrypt(Oaep::new::<Sha256>(), wrapped_key)
                .map_err(|_| CryptoError::Unwrap)?,
        );
        SymmetricKey::aus_slice(&bytes).ok_or(CryptoError::Unwrap)
    }

    /// PKCS#8-DER des privaten Schluessels (nur fuer die Versiegelung)
    pub(crate) fn pkcs8_der(&self) -> CryptoResult<Zeroizing<Vec<u8>>> {
        let doc = self
            .0
            .to_pkcs8_der()
            .map_err(|e| CryptoError::Intern(format!("PKCS#8-Kodierung fehlgeschlagen: {e}")))?;
        Ok(Zeroizing::new(doc.as_bytes().to_vec()))
    }

    /// Baut ein Handle aus PKCS#8-DER und prueft die Schluesselkonsistenz
    pub(crate) fn aus_pkcs8_der(der: &[u8]) -> CryptoResult<Self> {
        let key = RsaPrivateKey::from_pkcs8_der(der).map_err(|_| CryptoError::Unwrap)?;
        key.validate().map_err(|_| CryptoError::Unwrap)?;
        Ok(Self(Arc::new(key)))
    }
}

impl std::fmt::Debug for PrivateKeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKeyHandle([REDACTED])")
    }
}

/// Erzeugt ein frisches RSA-Schluesselpaar
///
/// Exponent 65537, Modulus mindestens [`MIN_MODULUS_BITS`] Bit.
pub fn generate_key_pair(modulus_bits: usize) -> CryptoResult<(PublicKey, PrivateKeyHandle)> {
    if modulus_bits < MIN_MODULUS_BITS {
        return Err(CryptoError::SchluesselGenerierung(format!(
            "Modulus zu klein: {modulus_bits} Bit (Minimum: {MIN_MODULUS_BITS})"
        )));
    }

    let exponent = BigUint::from(OEFFENTLICHER_EXPONENT);
    let private = RsaPrivateKey::new_with_exp(&mut OsRng, modulus_bits, &exponent)
        .map_err(|e| CryptoError::SchluesselGenerierung(e.to_string()))?;

    let handle = PrivateKeyHandle(Arc::new(private));
    let public = handle
        .public_key()
        .map_err(|e| CryptoError::SchluesselGenerierung(e.to_string()))?;

    tracing::debug!(bits = modulus_bits, "RSA-Schluesselpaar erzeugt");
    Ok((public, handle))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::traits::PublicKeyParts;

    #[test]
    fn zu_kleiner_modulus_wird_abgelehnt() {
        let result = generate_key_pair(1024);
        assert!(matches!(
            result,
            Err(CryptoError::SchluesselGenerierung(_))
        ));
    }

    #[test]
    fn schluesselpaar_hat_2048_bit_und_exponent_65537() {
        let (public, handle) = generate_key_pair(2048).unwrap();
        assert_eq!(public.modulus_bits(), 2048);
        assert_eq!(public.rsa().e(), &BigUint::from(65537u32));
        assert_eq!(handle.public_key().unwrap(), public);
    }

    #[test]
    fn handle_debug_ist_geschwaerzt() {
        let (_, handle) = generate_key_pair(2048).unwrap();
        assert_eq!(format!("{handle:?}"), "PrivateKeyHandle([REDACTED])");
    }

    #[test]
    fn pkcs8_roundtrip() {
        let (public, handle) = generate_key_pair(2048).unwrap();
        let der = handle.pkcs8_der().unwrap();
        let zurueck = PrivateKeyHandle::aus_pkcs8_der(&der).unwrap();
        assert_eq!(zurueck.public_key().unwrap(), public);
    }
}
