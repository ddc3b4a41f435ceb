//! Optimistic-concurrency primitives.
//!
//! This library provides the two building blocks every coordinator component
//! leans on:
//!
//! - **Content hashing**: capability and requirement sets are identified by a
//!   hash of their canonical JSON, so equal sets always collapse to one key.
//! - **Retry loops**: a conditioned write that loses a race returns "not
//!   applied"; the caller re-reads and tries again. [`retry_until_applied`]
//!   runs that loop with an explicit attempt and deadline budget.
//!
//! # Invariants
//!
//! - Hashes are deterministic given the same value, independent of map order
//! - A lost race is never an error; only budget exhaustion is

use std::future::Future;
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Deadline passed before a conditioned write applied.
    #[error("timeout after {elapsed:?} waiting for {operation} to apply")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    /// Attempt budget used up before a conditioned write applied.
    #[error("{operation} did not apply after {attempts} attempts")]
    Exhausted { operation: String, attempts: u32 },

    /// Value could not be serialized for hashing.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Identity of a capability or requirement set, derived from its content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Prefix of the textual form.
    pub const PREFIX: &'static str = "sha256:";

    /// Hash of the canonical form of `json`, truncated to 128 bits.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let digest = Sha256::digest(canonical_json(json).as_bytes());
        Self(format!("{}{}", Self::PREFIX, hex::encode(&digest[..16])))
    }

    /// Compute a content hash of any serializable value.
    pub fn of<T: Serialize>(value: &T) -> Result<Self, ReconcileError> {
        Ok(Self::from_json(&serde_json::to_value(value)?))
    }

    /// Wrap a hash read back from storage.
    ///
    /// Returns `None` unless the string has the `sha256:` prefix followed by
    /// 32 lowercase hex characters.
    pub fn parse(s: &str) -> Option<Self> {
        let digest = s.strip_prefix(Self::PREFIX)?;
        let valid = digest.len() == 32
            && digest
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        valid.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical JSON text: object keys sorted, no whitespace.
///
/// Scalars and keys are escaped by `serde_json` itself, so the output is
/// valid JSON that parses back to `value`.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Budget for an optimistic retry loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,

    /// Wall-clock budget across all attempts.
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            deadline: DEFAULT_RETRY_DEADLINE,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt budget and the default deadline.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }
}

/// Run `attempt` until it applies.
///
/// Each attempt must re-read current state and return `Ok(Some(_))` when its
/// conditioned write applied, `Ok(None)` when the precondition failed, or an
/// error for anything else. Errors end the loop immediately; only lost races
/// are retried.
pub async fn retry_until_applied<T, E, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    mut attempt: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    E: From<ReconcileError>,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if let Some(value) = attempt().await? {
            return Ok(value);
        }

        debug!(operation, attempts, "Conditioned write did not apply, retrying");

        if attempts >= policy.max_attempts {
            return Err(ReconcileError::Exhausted {
                operation: operation.to_string(),
                attempts,
            }
            .into());
        }
        let elapsed = start.elapsed();
        if elapsed >= policy.deadline {
            return Err(ReconcileError::Timeout {
                operation: operation.to_string(),
                elapsed,
            }
            .into());
        }
    }
}

/// Default attempt budget for retry loops.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 16;

/// Default deadline for retry loops.
pub const DEFAULT_RETRY_DEADLINE: Duration = Duration::from_secs(10);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_content_hash_deterministic() {
        let json1 = serde_json::json!({"b": 2, "a": 1});
        let json2 = serde_json::json!({"a": 1, "b": 2});

        assert_eq!(ContentHash::from_json(&json1), ContentHash::from_json(&json2));
    }

    #[test]
    fn test_content_hash_format() {
        let hash = ContentHash::of(&vec!["OS=Linux"]).unwrap();
        assert!(hash.as_str().starts_with("sha256:"));
        assert_eq!(hash.as_str().len(), "sha256:".len() + 32);
        assert_eq!(ContentHash::parse(hash.as_str()), Some(hash));
    }

    #[test]
    fn test_content_hash_parse_rejects_garbage() {
        assert!(ContentHash::parse("md5:abc").is_none());
        assert!(ContentHash::parse("sha256:XYZ").is_none());
    }

    #[test]
    fn test_canonical_json_escapes() {
        let json = serde_json::json!({"k": "a\"b\n"});
        assert_eq!(canonical_json(&json), r#"{"k":"a\"b\n"}"#);
    }

    #[tokio::test]
    async fn test_retry_returns_first_applied_value() {
        let mut calls = 0;
        let result: Result<u32, ReconcileError> =
            retry_until_applied("test", &RetryPolicy::attempts(5), || {
                calls += 1;
                let current = calls;
                async move { Ok((current == 3).then_some(current)) }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let result: Result<(), ReconcileError> =
            retry_until_applied("never", &RetryPolicy::attempts(2), || async { Ok(None) }).await;
        assert!(matches!(
            result.unwrap_err(),
            ReconcileError::Exhausted { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_retry_honours_deadline() {
        let policy = RetryPolicy {
            max_attempts: u32::MAX,
            deadline: Duration::ZERO,
        };
        let result: Result<(), ReconcileError> =
            retry_until_applied("slow", &policy, || async { Ok(None) }).await;
        assert!(matches!(result.unwrap_err(), ReconcileError::Timeout { .. }));
    }

    proptest! {
        #[test]
        fn hash_ignores_insertion_order(entries in proptest::collection::vec(("[a-z]{1,8}", 0u32..64), 0..16)) {
            let forward: serde_json::Map<String, serde_json::Value> = entries
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::json!(v)))
                .collect();
            let reversed: serde_json::Map<String, serde_json::Value> = entries
                .iter()
                .rev()
                .map(|(k, v)| (k.clone(), serde_json::json!(v)))
                .collect();
            let unique: BTreeMap<_, _> = entries.iter().cloned().collect();
            prop_assume!(unique.len() == entries.len());
            prop_assert_eq!(
                ContentHash::from_json(&serde_json::Value::Object(forward)),
                ContentHash::from_json(&serde_json::Value::Object(reversed))
            );
        }
    }
}
