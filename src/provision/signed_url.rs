//! Time-limited capability URLs.
//!
//! A URL carries `expires` (unix seconds) and `signature`, the hex
//! HMAC-SHA256 of the path, the sorted signed query parameters and the
//! expiry. Parameters in [`UNSIGNED_PARAMS`] are supplied by the caller of
//! the URL and are never part of the signature.

use chrono::{DateTime, Duration, Utc};
use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

/// Query parameters the host appends to a callback URL.
pub const UNSIGNED_PARAMS: [&str; 2] = ["step", "status"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("missing signature")]
    Missing,

    #[error("link has expired")]
    Expired,

    #[error("signature does not match")]
    Invalid,
}

#[derive(Clone)]
pub struct UrlSigner {
    base: Url,
    keyed: HmacSha256,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner").field("base", &self.base.as_str()).finish()
    }
}

impl UrlSigner {
    pub fn new(base: Url, key: impl AsRef<[u8]>) -> Result<Self, InvalidLength> {
        Ok(Self {
            base,
            keyed: HmacSha256::new_from_slice(key.as_ref())?,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Builds an absolute signed URL for `path`, valid for `ttl`.
    pub fn sign(&self, path: &str, params: &[(&str, &str)], ttl: Duration) -> Result<Url, url::ParseError> {
        self.sign_until(path, params, Utc::now() + ttl)
    }

    pub fn sign_until(
        &self,
        path: &str,
        params: &[(&str, &str)],
        expires: DateTime<Utc>,
    ) -> Result<Url, url::ParseError> {
        let mut url = self.base.join(path)?;
        let expires = expires.timestamp().to_string();

        let mut signed: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        signed.push(("expires".to_string(), expires));

        let signature = hex::encode(self.mac(url.path(), &signed).finalize().into_bytes());

        {
            let mut query = url.query_pairs_mut();
            for (k, v) in &signed {
                query.append_pair(k, v);
            }
            query.append_pair("signature", &signature);
        }
        Ok(url)
    }

    /// Checks the signature and expiry of a request to `path` carrying
    /// `query`; the comparison is constant time.
    pub fn verify(
        &self,
        path: &str,
        query: &[(String, String)],
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let signature = query
            .iter()
            .find(|(k, _)| k == "signature")
            .map(|(_, v)| v.as_str())
            .ok_or(SignatureError::Missing)?;
        let expected = hex::decode(signature).map_err(|_| SignatureError::Invalid)?;

        let signed: Vec<(String, String)> = query
            .iter()
            .filter(|(k, _)| k != "signature" && !UNSIGNED_PARAMS.contains(&k.as_str()))
            .cloned()
            .collect();

        self.mac(path, &signed)
            .verify_slice(&expected)
            .map_err(|_| SignatureError::Invalid)?;

        let expires = signed
            .iter()
            .find(|(k, _)| k == "expires")
            .and_then(|(_, v)| v.parse::<i64>().ok())
            .ok_or(SignatureError::Invalid)?;
        if now.timestamp() > expires {
            return Err(SignatureError::Expired);
        }
        Ok(())
    }

    fn mac(&self, path: &str, params: &[(String, String)]) -> HmacSha256 {
        let mut sorted: Vec<&(String, String)> = params.iter().collect();
        sorted.sort();

        let canonical = sorted
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let mut mac = self.keyed.clone();
        mac.update(path.as_bytes());
        mac.update(b"?");
        mac.update(canonical.as_bytes());
        mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> UrlSigner {
        UrlSigner::new(Url::parse("https://panel.example.com").unwrap(), "test-key").unwrap()
    }

    fn query_of(url: &Url) -> Vec<(String, String)> {
        url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect()
    }

    #[test]
    fn test_signed_url_verifies() {
        let url = signer()
            .sign("/servers/abc/provision/step", &[], Duration::hours(2))
            .unwrap();
        assert!(url.as_str().starts_with("https://panel.example.com/servers/abc/provision/step?expires="));

        let result = signer().verify(url.path(), &query_of(&url), Utc::now());
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn test_host_params_do_not_break_signature() {
        let mut url = signer()
            .sign("/servers/abc/provision/step", &[], Duration::hours(2))
            .unwrap();
        url.query_pairs_mut()
            .append_pair("step", "2")
            .append_pair("status", "completed");

        assert!(signer().verify(url.path(), &query_of(&url), Utc::now()).is_ok());
    }

    #[test]
    fn test_other_server_path_is_rejected() {
        let url = signer()
            .sign("/servers/abc/provision/step", &[], Duration::hours(2))
            .unwrap();
        let result = signer().verify("/servers/xyz/provision/step", &query_of(&url), Utc::now());
        assert_eq!(result, Err(SignatureError::Invalid));
    }

    #[test]
    fn test_expired_and_missing() {
        let url = signer()
            .sign("/servers/abc/provision/step", &[], Duration::minutes(5))
            .unwrap();
        let later = Utc::now() + Duration::minutes(10);
        assert_eq!(
            signer().verify(url.path(), &query_of(&url), later),
            Err(SignatureError::Expired)
        );
        assert_eq!(
            signer().verify(url.path(), &[], Utc::now()),
            Err(SignatureError::Missing)
        );
    }

    #[test]
    fn test_tampered_expiry_is_rejected() {
        let url = signer()
            .sign("/servers/abc/provision/script", &[], Duration::minutes(5))
            .unwrap();
        let query: Vec<(String, String)> = query_of(&url)
            .into_iter()
            .map(|(k, v)| if k == "expires" { (k, "9999999999".to_string()) } else { (k, v) })
            .collect();
        assert_eq!(
            signer().verify(url.path(), &query, Utc::now()),
            Err(SignatureError::Invalid)
        );
    }

    #[test]
    fn test_different_key_is_rejected() {
        let url = signer().sign("/p", &[], Duration::minutes(5)).unwrap();
        let other = UrlSigner::new(Url::parse("https://panel.example.com").unwrap(), "other").unwrap();
        assert!(other.verify(url.path(), &query_of(&url), Utc::now()).is_err());
    }
}
