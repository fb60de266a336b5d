//! Schluesselverwahrung (KeyCustody)
//!
//! Verwaltet pro Identitaet ein RSA-Schluesselpaar. Der oeffentliche Schluessel
//! ist frei abrufbar, der private verlaesst die Verwahrung nur versiegelt.
//!
//! ## Lebenszyklus privater Schluessel
//! - `register`: erzeugt das Paar, privater Schluessel ist resident
//! - `seal`: versiegelte Kopie fuer die Persistenz
//! - `evict`: Sitzungsende, nur der oeffentliche Schluessel bleibt
//! - `unseal_into`: neue Sitzung, Schluessel wird wieder resident

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kurier_core::types::IdentityId;
use std::sync::Arc;

use crate::error::{CryptoError, CryptoResult};
use crate::keypair::{generate_key_pair, PrivateKeyHandle};
use crate::sealing::{self, SealedPrivateKey, SealingParams};
use crate::types::{PublicKey, SymmetricKey, MIN_MODULUS_BITS};

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Konfiguration der Schluesselverwahrung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustodyConfig {
    /// RSA-Modulus fuer neue Schluesselpaare
    pub modulus_bits: usize,
    /// Argon2id-Parameter fuer `seal`
    pub sealing: SealingParams,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            modulus_bits: MIN_MODULUS_BITS,
            sealing: SealingParams::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// KeyCustody
// ---------------------------------------------------------------------------

struct Eintrag {
    public: PublicKey,
    /// `None` solange die Identitaet keine aktive Sitzung hat
    private: Option<PrivateKeyHandle>,
}

struct Inner {
    eintraege: DashMap<IdentityId, Eintrag>,
    config: CustodyConfig,
}

/// Verwahrt die Schluesselpaare aller registrierten Identitaeten
///
/// Clone ist guenstig und teilt den Zustand.
#[derive(Clone)]
pub struct KeyCustody {
    inner: Arc<Inner>,
}

impl KeyCustody {
    /// Erstellt eine leere Verwahrung
    ///
    /// Lehnt Modulus-Groessen unter 2048 Bit ab.
    pub fn neu(config: CustodyConfig) -> CryptoResult<Self> {
        if config.modulus_bits < MIN_MODULUS_BITS {
            return Err(CryptoError::SchluesselGenerierung(format!(
                "Modulus zu klein: {} Bit (Minimum: {MIN_MODULUS_BITS})",
                config.modulus_bits
            )));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                eintraege: DashMap::new(),
                config,
            }),
        })
    }

    pub fn config(&self) -> &CustodyConfig {
        &self.inner.config
    }

    /// Erzeugt ein Schluesselpaar mit der konfigurierten Modulus-Groesse
    ///
    /// Das Paar wird nicht gespeichert; dafuer `register` oder `einlagern`.
    pub fn generate_key_pair(&self) -> CryptoResult<(PublicKey, PrivateKeyHandle)> {
        generate_key_pair(self.inner.config.modulus_bits)
    }

    /// Erzeugt und speichert das Schluesselpaar einer Identitaet
    ///
    /// Schluesselpaare sind unveraenderlich: eine zweite Registrierung
    /// derselben Identitaet schlaegt fehl.
    pub fn register(&self, identity_id: IdentityId) -> CryptoResult<PublicKey> {
        if self.inner.eintraege.contains_key(&identity_id) {
            return Err(CryptoError::BereitsRegistriert(identity_id));
        }

        let (public, private) = self.generate_key_pair()?;
        self.einlagern(identity_id, public.clone(), private)?;

        tracing::info!(identity = %identity_id, bits = public.modulus_bits(), "Identitaet registriert");
        Ok(public)
    }

    /// Speichert ein bereits erzeugtes Schluesselpaar
    pub fn einlagern(
        &self,
        identity_id: IdentityId,
        public: PublicKey,
        private: PrivateKeyHandle,
    ) -> CryptoResult<()> {
        if private.public_key()? != public {
            return Err(CryptoError::Verschluesselung(
                "Oeffentlicher Schluessel passt nicht zum privaten".into(),
            ));
        }

        match self.inner.eintraege.entry(identity_id) {
            Entry::Occupied(_) => Err(CryptoError::BereitsRegistriert(identity_id)),
            Entry::Vacant(slot) => {
                slot.insert(Eintrag {
                    public,
                    private: Some(private),
                });
                Ok(())
            }
        }
    }

    /// Oeffentlicher Schluessel einer Identitaet
    pub fn get_public_key(&self, identity_id: IdentityId) -> CryptoResult<PublicKey> {
        self.inner
            .eintraege
            .get(&identity_id)
            .map(|e| e.public.clone())
            .ok_or(CryptoError::NichtGefunden(identity_id))
    }

    /// Entpackt einen Wrapped Key mit dem privaten Schluessel der Identitaet
    ///
    /// `NichtGefunden` wenn die Identitaet unbekannt oder ihr privater
    /// Schluessel nicht resident ist, sonst `Unwrap` bei jedem Fehler.
    pub fn decrypt_wrapped_key(
        &self,
        identity_id: IdentityId,
        wrapped_key: &[u8],
    ) -> CryptoResult<SymmetricKey> {
        // Handle klonen, damit der DashMap-Shard waehrend RSA nicht gesperrt bleibt
        let handle = self.private_handle(identity_id)?;

        handle.unwrap_key(wrapped_key).map_err(|e| {
            tracing::warn!(
                identity = %identity_id,
                wrapped_len = wrapped_key.len(),
                "Wrapped Key konnte nicht entpackt werden"
            );
            e
        })
    }

    /// Versiegelt den residenten privaten Schluessel fuer die Ablage
    pub fn seal(&self, identity_id: IdentityId, credential: &[u8]) -> CryptoResult<SealedPrivateKey> {
        let handle = self.private_handle(identity_id)?;
        let sealed = sealing::versiegeln(identity_id, &handle, credential, self.inner.config.sealing)?;
        tracing::debug!(identity = %identity_id, "Privater Schluessel versiegelt");
        Ok(sealed)
    }

    /// Entsiegelt einen privaten Schluessel und macht ihn resident
    ///
    /// Der Schluessel muss zu `public` passen, und falls die Identitaet bereits
    /// bekannt ist, auch zu deren gespeichertem oeffentlichen Schluessel.
    /// Falsches Credential ergibt `Unwrap`.
    pub fn unseal_into(
        &self,
        identity_id: IdentityId,
        public: &PublicKey,
        sealed: &SealedPrivateKey,
        credential: &[u8],
    ) -> CryptoResult<()> {
        let handle = sealing::entsiegeln(identity_id, sealed, credential).map_err(|e| {
            tracing::warn!(identity = %identity_id, "Entsiegeln fehlgeschlagen");
            e
        })?;

        if &handle.public_key()? != public {
            tracing::warn!(identity = %identity_id, "Entsiegelter Schluessel passt nicht zum Public Key");
            return Err(CryptoError::Unwrap);
        }

        match self.inner.eintraege.entry(identity_id) {
            Entry::Occupied(mut eintrag) => {
                if &eintrag.get().public != public {
                    tracing::warn!(identity = %identity_id, "Public Key weicht vom registrierten ab");
                    return Err(CryptoError::Unwrap);
                }
                eintrag.get_mut().private = Some(handle);
            }
            Entry::Vacant(slot) => {
                slot.insert(Eintrag {
                    public: public.clone(),
                    private: Some(handle),
                });
            }
        }

        tracing::debug!(identity = %identity_id, "Privater Schluessel resident");
        Ok(())
    }

    /// Entfernt den residenten privaten Schluessel (Sitzungsende)
    ///
    /// Gibt `true` zurueck, wenn ein Schluessel resident war.
    pub fn evict(&self, identity_id: IdentityId) -> bool {
        let entfernt = self
            .inner
            .eintraege
            .get_mut(&identity_id)
            .and_then(|mut e| e.private.take())
            .is_some();
        if entfernt {
            tracing::debug!(identity = %identity_id, "Privater Schluessel entladen");
        }
        entfernt
    }

    /// Ist der private Schluessel der Identitaet aktuell geladen?
    pub fn ist_resident(&self, identity_id: IdentityId) -> bool {
        self.inner
            .eintraege
            .get(&identity_id)
            .is_some_and(|e| e.private.is_some())
    }

    pub fn ist_registriert(&self, identity_id: IdentityId) -> bool {
        self.inner.eintraege.contains_key(&identity_id)
    }

    /// Anzahl bekannter Identitaeten
    pub fn anzahl(&self) -> usize {
        self.inner.eintraege.len()
    }

    fn private_handle(&self, identity_id: IdentityId) -> CryptoResult<PrivateKeyHandle> {
        self.inner
            .eintraege
            .get(&identity_id)
            .and_then(|e| e.private.clone())
            .ok_or(CryptoError::NichtGefunden(identity_id))
    }
}

impl std::fmt::Debug for KeyCustody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCustody")
            .field("identitaeten", &self.anzahl())
            .field("modulus_bits", &self.inner.config.modulus_bits)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use rsa::Oaep;
    use sha2::Sha256;

    fn test_custody() -> KeyCustody {
        KeyCustody::neu(CustodyConfig {
            modulus_bits: 2048,
            sealing: SealingParams {
                m_cost: 256,
                t_cost: 1,
                p_cost: 1,
            },
        })
        .unwrap()
    }

    fn wrap(public: &PublicKey, key: &[u8]) -> Vec<u8> {
        public
            .rsa()
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key)
            .unwrap()
    }

    #[test]
    fn zu_kleiner_modulus_in_config() {
        let result = KeyCustody::neu(CustodyConfig {
            modulus_bits: 1024,
            ..CustodyConfig::default()
        });
        assert!(matches!(result, Err(CryptoError::SchluesselGenerierung(_))));
    }

    #[test]
    fn register_und_public_key_abrufen() {
        let custody = test_custody();
        let alice = IdentityId::new();

        let public = custody.register(alice).unwrap();
        assert_eq!(custody.get_public_key(alice).unwrap(), public);
        assert!(custody.ist_resident(alice));
        assert_eq!(custody.anzahl(), 1);
    }

    #[test]
    fn doppelte_registrierung_schlaegt_fehl() {
        let custody = test_custody();
        let alice = IdentityId::new();
        let erster = custody.register(alice).unwrap();

        let result = custody.register(alice);
        assert!(matches!(result, Err(CryptoError::BereitsRegistriert(id)) if id == alice));
        assert_eq!(custody.get_public_key(alice).unwrap(), erster);
    }

    #[test]
    fn unbekannte_identitaet_ist_nicht_gefunden() {
        let custody = test_custody();
        let niemand = IdentityId::new();
        assert!(matches!(
            custody.get_public_key(niemand),
            Err(CryptoError::NichtGefunden(_))
        ));
        assert!(matches!(
            custody.decrypt_wrapped_key(niemand, &[0u8; 256]),
            Err(CryptoError::NichtGefunden(_))
        ));
    }

    #[test]
    fn wrapped_key_wird_entpackt() {
        let custody = test_custody();
        let bob = IdentityId::new();
        let public = custody.register(bob).unwrap();

        let key = SymmetricKey::generieren();
        let wrapped = wrap(&public, key.as_bytes());
        assert_eq!(custody.decrypt_wrapped_key(bob, &wrapped).unwrap(), key);
    }

    #[test]
    fn wrapped_key_mit_falscher_laenge_ist_unwrap_fehler() {
        let custody = test_custody();
        let bob = IdentityId::new();
        let public = custody.register(bob).unwrap();

        let wrapped = wrap(&public, &[7u8; 16]);
        assert!(matches!(
            custody.decrypt_wrapped_key(bob, &wrapped),
            Err(CryptoError::Unwrap)
        ));
    }

    #[test]
    fn fremder_wrapped_key_ist_unwrap_fehler() {
        let custody = test_custody();
        let alice = IdentityId::new();
        let bob = IdentityId::new();
        let alice_key = custody.register(alice).unwrap();
        custody.register(bob).unwrap();

        let wrapped = wrap(&alice_key, SymmetricKey::generieren().as_bytes());
        assert!(matches!(
            custody.decrypt_wrapped_key(bob, &wrapped),
            Err(CryptoError::Unwrap)
        ));
        assert!(matches!(
            custody.decrypt_wrapped_key(bob, b"kurz"),
            Err(CryptoError::Unwrap)
        ));
    }

    #[test]
    fn einlagern_prueft_zusammengehoerigkeit() {
        let custody = test_custody();
        let (public_a, _) = custody.generate_key_pair().unwrap();
        let (_, private_b) = custody.generate_key_pair().unwrap();

        let result = custody.einlagern(IdentityId::new(), public_a, private_b);
        assert!(matches!(result, Err(CryptoError::Verschluesselung(_))));
        assert_eq!(custody.anzahl(), 0);
    }

    #[test]
    fn evict_und_unseal_zyklus() {
        let custody = test_custody();
        let bob = IdentityId::new();
        let public = custody.register(bob).unwrap();
        let key = SymmetricKey::generieren();
        let wrapped = wrap(&public, key.as_bytes());

        let sealed = custody.seal(bob, b"passwort").unwrap();
        assert!(custody.evict(bob));
        assert!(!custody.evict(bob));

        // Public Key bleibt, private Operationen nicht
        assert_eq!(custody.get_public_key(bob).unwrap(), public);
        assert!(matches!(
            custody.decrypt_wrapped_key(bob, &wrapped),
            Err(CryptoError::NichtGefunden(_))
        ));

        custody.unseal_into(bob, &public, &sealed, b"passwort").unwrap();
        assert!(custody.ist_resident(bob));
        assert_eq!(custody.decrypt_wrapped_key(bob, &wrapped).unwrap(), key);
    }

    #[test]
    fn unseal_mit_falschem_credential() {
        let custody = test_custody();
        let bob = IdentityId::new();
        let public = custody.register(bob).unwrap();
        let sealed = custody.seal(bob, b"richtig").unwrap();
        custody.evict(bob);

        let result = custody.unseal_into(bob, &public, &sealed, b"falsch");
        assert!(matches!(result, Err(CryptoError::Unwrap)));
        assert!(!custody.ist_resident(bob));
    }

    #[test]
    fn unseal_in_frische_verwahrung() {
        let alt = test_custody();
        let bob = IdentityId::new();
        let public = alt.register(bob).unwrap();
        let sealed = alt.seal(bob, b"pw").unwrap();

        let neu = test_custody();
        neu.unseal_into(bob, &public, &sealed, b"pw").unwrap();
        assert_eq!(neu.get_public_key(bob).unwrap(), public);
        assert!(neu.ist_resident(bob));
    }

    #[test]
    fn unseal_mit_fremdem_public_key() {
        let custody = test_custody();
        let bob = IdentityId::new();
        custody.register(bob).unwrap();
        let sealed = custody.seal(bob, b"pw").unwrap();
        let (fremd, _) = custody.generate_key_pair().unwrap();

        let result = custody.unseal_into(bob, &fremd, &sealed, b"pw");
        assert!(matches!(result, Err(CryptoError::Unwrap)));
    }

    #[test]
    fn clone_teilt_zustand() {
        let custody = test_custody();
        let kopie = custody.clone();
        let id = IdentityId::new();
        custody.register(id).unwrap();
        assert!(kopie.ist_registriert(id));
    }
}
