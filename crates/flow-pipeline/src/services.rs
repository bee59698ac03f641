//! External subsystems reached through the outbox.
//!
//! Real deployments put signing, persistence and database access behind the
//! bus. The services here answer in-process for the loopback bus.

use std::collections::HashMap;

use flow_types::{ExternalErrorKind, ExternalOutcome, ExternalRequest, Payload};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Something that answers external requests.
///
/// Implementations may see the same request more than once and must answer
/// consistently.
pub trait ExternalService: Send + Sync {
    fn handle(&self, request: &ExternalRequest) -> ExternalOutcome;
}

/// Signs payloads with a keyed SHA-256 digest.
///
/// Stands in for a signing service; the digest is not a signature scheme.
pub struct DemoSigningService {
    key: Vec<u8>,
}

impl DemoSigningService {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    /// The hex digest this service returns for `payload`.
    pub fn sign(&self, payload: &Payload) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        hasher.update(payload.as_bytes());
        hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl ExternalService for DemoSigningService {
    fn handle(&self, request: &ExternalRequest) -> ExternalOutcome {
        if request.payload.is_empty() {
            return ExternalOutcome::Failure {
                kind: ExternalErrorKind::Platform,
                message: "nothing to sign".into(),
            };
        }
        debug!(request_id = %request.request_id, attempt = request.attempt, "Signing");
        ExternalOutcome::Success {
            payload: Payload::from(self.sign(&request.payload)),
        }
    }
}

/// A persistence command, JSON encoded in the request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PersistenceCommand {
    Put { key: String, value: Payload },
    Get { key: String },
}

/// Key/value persistence held in memory.
#[derive(Debug, Default)]
pub struct InMemoryPersistenceService {
    entries: Mutex<HashMap<String, Payload>>,
}

impl InMemoryPersistenceService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Payload> {
        self.entries.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ExternalService for InMemoryPersistenceService {
    fn handle(&self, request: &ExternalRequest) -> ExternalOutcome {
        let command: PersistenceCommand = match request.payload.to_json() {
            Ok(command) => command,
            Err(e) => {
                return ExternalOutcome::Failure {
                    kind: ExternalErrorKind::Fatal,
                    message: format!("malformed persistence command: {}", e),
                }
            }
        };

        match command {
            PersistenceCommand::Put { key, value } => {
                debug!(request_id = %request.request_id, key = %key, "Storing value");
                self.entries.lock().insert(key.clone(), value);
                ExternalOutcome::Success {
                    payload: Payload::from(key),
                }
            }
            PersistenceCommand::Get { key } => match self.get(&key) {
                Some(value) => ExternalOutcome::Success { payload: value },
                None => ExternalOutcome::Failure {
                    kind: ExternalErrorKind::Platform,
                    message: format!("no value stored under {}", key),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flow_types::{ExternalCategory, FlowId, RequestId};

    fn request(category: ExternalCategory, payload: Payload) -> ExternalRequest {
        ExternalRequest {
            flow_id: FlowId::from("f1"),
            request_id: RequestId::from("f1-request-1"),
            category,
            payload,
            attempt: 1,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn signing_is_deterministic_per_key() {
        let service = DemoSigningService::new("k1");
        let req = request(ExternalCategory::Crypto, Payload::from("tx"));
        assert_eq!(service.handle(&req), service.handle(&req));
        assert_ne!(service.sign(&req.payload), DemoSigningService::new("k2").sign(&req.payload));
        assert_eq!(service.sign(&req.payload).len(), 64);
    }

    #[test]
    fn put_then_get() {
        let service = InMemoryPersistenceService::new();
        let put = PersistenceCommand::Put {
            key: "doc".into(),
            value: Payload::from("sig"),
        };
        let outcome = service.handle(&request(ExternalCategory::Persistence, Payload::from_json(&put).unwrap()));
        assert!(matches!(outcome, ExternalOutcome::Success { .. }));

        let get = PersistenceCommand::Get { key: "doc".into() };
        let outcome = service.handle(&request(ExternalCategory::Persistence, Payload::from_json(&get).unwrap()));
        assert_eq!(
            outcome,
            ExternalOutcome::Success {
                payload: Payload::from("sig")
            }
        );
    }

    #[test]
    fn missing_key_is_a_platform_failure() {
        let service = InMemoryPersistenceService::new();
        let get = PersistenceCommand::Get { key: "nope".into() };
        let outcome = service.handle(&request(ExternalCategory::Persistence, Payload::from_json(&get).unwrap()));
        assert!(matches!(
            outcome,
            ExternalOutcome::Failure {
                kind: ExternalErrorKind::Platform,
                ..
            }
        ));
    }
}
