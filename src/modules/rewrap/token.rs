//! Policy tokens: JWTs naming the subscriber, the asset and the device.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::modules::policy::DeviceInfo;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyClaims {
    pub sub: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    pub asset_id: String,
    /// ISO 3166-1 alpha-2
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_region: Option<String>,
    #[serde(default)]
    pub device: DeviceInfo,
}

/// Verifies policy tokens. Without a configured key the signature is not
/// checked (development mode); expiry is enforced either way.
#[derive(Clone)]
pub struct TokenValidator {
    decoding_key: Option<DecodingKey>,
}

impl TokenValidator {
    /// ES256 validation against a PEM `PUBLIC KEY`.
    pub fn from_ec_pem(pem: &str) -> Result<Self, jsonwebtoken::errors::Error> {
        Ok(TokenValidator {
            decoding_key: Some(DecodingKey::from_ec_pem(pem.as_bytes())?),
        })
    }

    pub fn insecure() -> Self {
        warn!("Policy token signatures are NOT verified (no OAuth public key configured)");
        TokenValidator { decoding_key: None }
    }

    pub fn is_verifying(&self) -> bool {
        self.decoding_key.is_some()
    }

    pub fn validate(&self, token: &str) -> Result<PolicyClaims, jsonwebtoken::errors::Error> {
        let mut validation = Validation::new(Algorithm::ES256);
        validation.validate_exp = true;
        validation.validate_aud = false;

        let token_data = match &self.decoding_key {
            Some(key) => decode::<PolicyClaims>(token, key, &validation)?,
            None => {
                validation.insecure_disable_signature_validation();
                decode::<PolicyClaims>(token, &DecodingKey::from_secret(&[]), &validation)?
            }
        };
        Ok(token_data.claims)
    }
}
