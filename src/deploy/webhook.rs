//! Source-control push webhooks.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::error::{HostwrightError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_HEADER: &str = "x-github-event";

/// Checks `sha256=<hex>` against the HMAC of the raw body, in constant time.
pub fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> Result<()> {
    let header = header
        .ok_or_else(|| HostwrightError::Authorization("missing webhook signature".to_string()))?;
    let hex_digest = header.strip_prefix("sha256=").ok_or_else(|| {
        HostwrightError::Authorization("webhook signature must start with sha256=".to_string())
    })?;
    let expected = hex::decode(hex_digest)
        .map_err(|_| HostwrightError::Authorization("malformed webhook signature".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| HostwrightError::Config(format!("Invalid webhook secret: {}", e)))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| HostwrightError::Authorization("webhook signature does not match".to_string()))
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    after: Option<String>,
    repository: PushRepository,
    head_commit: Option<HeadCommit>,
    pusher: Option<Pusher>,
}

#[derive(Debug, Deserialize)]
struct PushRepository {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct HeadCommit {
    id: String,
    message: Option<String>,
    author: Option<Pusher>,
}

#[derive(Debug, Deserialize)]
struct Pusher {
    name: Option<String>,
}

/// The part of a push event a deployment needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub repository: String,
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub author: Option<String>,
    pub message: Option<String>,
}

pub fn parse_push(body: &[u8]) -> Result<PushEvent> {
    let payload: PushPayload = serde_json::from_slice(body)?;

    let branch = payload
        .git_ref
        .strip_prefix("refs/heads/")
        .map(str::to_string);
    let commit_sha = payload
        .head_commit
        .as_ref()
        .map(|c| c.id.clone())
        .or(payload.after)
        .filter(|sha| !sha.chars().all(|c| c == '0'));
    let author = payload
        .head_commit
        .as_ref()
        .and_then(|c| c.author.as_ref())
        .and_then(|a| a.name.clone())
        .or_else(|| payload.pusher.and_then(|p| p.name));

    Ok(PushEvent {
        repository: payload.repository.full_name,
        branch,
        commit_sha,
        author,
        message: payload.head_commit.and_then(|c| c.message),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    pub(crate) const PUSH: &str = r#"{
        "ref": "refs/heads/main",
        "after": "9f2c1e0d",
        "repository": {"full_name": "acme/shop"},
        "head_commit": {"id": "9f2c1e0d", "message": "Fix checkout", "author": {"name": "Dana"}},
        "pusher": {"name": "dana"}
    }"#;

    #[test]
    fn test_signature_round_trip() {
        let body = PUSH.as_bytes();
        let header = sign("s3cret", body);
        verify_signature("s3cret", body, Some(&header)).unwrap();

        assert!(verify_signature("other", body, Some(&header)).is_err());
        assert!(verify_signature("s3cret", b"{}", Some(&header)).is_err());
        assert!(verify_signature("s3cret", body, None).is_err());
        assert!(verify_signature("s3cret", body, Some("sha1=abcd")).is_err());
    }

    #[test]
    fn test_parse_push() {
        let event = parse_push(PUSH.as_bytes()).unwrap();
        assert_eq!(
            event,
            PushEvent {
                repository: "acme/shop".to_string(),
                branch: Some("main".to_string()),
                commit_sha: Some("9f2c1e0d".to_string()),
                author: Some("Dana".to_string()),
                message: Some("Fix checkout".to_string()),
            }
        );
    }

    #[test]
    fn test_tag_push_has_no_branch() {
        let body = r#"{"ref": "refs/tags/v1.0", "after": "0000000000", "repository": {"full_name": "acme/shop"}}"#;
        let event = parse_push(body.as_bytes()).unwrap();
        assert_eq!(event.branch, None);
        assert_eq!(event.commit_sha, None);
    }
}
