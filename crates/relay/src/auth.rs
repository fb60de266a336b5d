//! Identitaets-Verifikation – Schnittstelle zum Auth-Service
//!
//! Der Relay vertraut nur Identitaeten, die ein `IdentityVerifier`
//! bestaetigt hat. Ausstellung und OTP-Pruefung liegen ausserhalb.

use kurier_core::types::IdentityId;
use std::collections::HashMap;

use crate::error::{RelayError, RelayResult};

/// Prueft die Identitaet aus dem `Hello`-Frame einer Verbindung
pub trait IdentityVerifier: Send + Sync + 'static {
    /// Gibt die verifizierte Identitaet zurueck
    fn verify(&self, identity_id: IdentityId, token: &str) -> RelayResult<IdentityId>;
}

/// Verifier mit fest konfigurierten Bearer-Tokens
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, IdentityId>,
}

impl StaticTokenVerifier {
    pub fn neu(tokens: impl IntoIterator<Item = (String, IdentityId)>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }

    pub fn token_hinzufuegen(&mut self, token: impl Into<String>, identity_id: IdentityId) {
        self.tokens.insert(token.into(), identity_id);
    }

    pub fn anzahl(&self) -> usize {
        self.tokens.len()
    }
}

impl IdentityVerifier for StaticTokenVerifier {
    fn verify(&self, identity_id: IdentityId, token: &str) -> RelayResult<IdentityId> {
        match self.tokens.get(token) {
            Some(erwartet) if *erwartet == identity_id => Ok(identity_id),
            Some(_) => {
                tracing::warn!(identity = %identity_id, "Token gehoert zu einer anderen Identitaet");
                Err(RelayError::NichtAuthentifiziert(
                    "Token passt nicht zur Identitaet".into(),
                ))
            }
            None => Err(RelayError::NichtAuthentifiziert("Unbekanntes Token".into())),
        }
    }
}
