use ::hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use crate::error::{AppError, Result};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// Checks `sha256=<hex>` request signatures against a shared secret.
pub struct HmacValidator {
    secret: String,
    header_name: String,
}

impl HmacValidator {
    pub fn new(secret: String, header_name: String) -> Self {
        Self { secret, header_name }
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    pub fn validate(&self, body: &[u8], signature_header: &str) -> Result<()> {
        let signature = signature_header
            .trim()
            .strip_prefix(SIGNATURE_PREFIX)
            .ok_or_else(|| {
                tracing::warn!("Rejected webhook request: signature header without {} prefix", SIGNATURE_PREFIX);
                AppError::InvalidSignatureFormat
            })?;

        let expected = hex::decode(signature).map_err(|_| AppError::HmacValidation)?;
        let computed = self.sign(body)?;

        if bool::from(computed.ct_eq(&expected)) {
            Ok(())
        } else {
            tracing::warn!("Rejected webhook request: signature mismatch ({} byte body)", body.len());
            Err(AppError::HmacValidation)
        }
    }

    fn sign(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| AppError::Config("Invalid HMAC secret".to_string()))?;

        mac.update(body);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_validation_success() {
        let validator = HmacValidator::new("test_secret".to_string(), "X-Hub-Signature".to_string());
        let body = b"{\"level\":\"info\"}";

        let header = format!("sha256={}", hex::encode(validator.sign(body).unwrap()));
        assert!(validator.validate(body, &header).is_ok());
    }

    #[test]
    fn test_hmac_validation_failure() {
        let validator = HmacValidator::new("test_secret".to_string(), "X-Hub-Signature".to_string());

        assert!(matches!(
            validator.validate(b"body", "sha256=00ff"),
            Err(AppError::HmacValidation)
        ));
        assert!(matches!(
            validator.validate(b"body", "md5=00ff"),
            Err(AppError::InvalidSignatureFormat)
        ));
    }
}
