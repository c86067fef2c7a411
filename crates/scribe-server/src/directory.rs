// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! The target directory: which documents exist, under which shared secrets.
//!
//! A constructor-injected registry, one per server process. Connections
//! consult it to verify challenge responses and to open sessions on
//! authorized documents.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use scribe_delta::AuthorId;
use scribe_doc::{random_session_id, DocHost, Session};
use scribe_proto::auth::challenge_response;
use scribe_proto::{names, ErrorInfo};

struct DirectoryEntry {
    secret: Vec<u8>,
    host: Arc<DocHost>,
}

/// Registry of authorizable RPC targets (documents, today).
#[derive(Default)]
pub struct TargetDirectory {
    entries: RwLock<HashMap<String, DirectoryEntry>>,
}

impl TargetDirectory {
    /// An empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a document under `target_id`, reachable by clients that
    /// can prove possession of `secret`.
    pub async fn register(&self, target_id: impl Into<String>, secret: &[u8], host: Arc<DocHost>) {
        self.entries.write().await.insert(
            target_id.into(),
            DirectoryEntry {
                secret: secret.to_vec(),
                host,
            },
        );
    }

    /// Whether `target_id` names a registered target.
    pub async fn contains(&self, target_id: &str) -> bool {
        self.entries.read().await.contains_key(target_id)
    }

    /// Verifies a challenge response and opens a session on success.
    ///
    /// # Errors
    ///
    /// `authFailed` on a wrong response or unknown target — the two cases
    /// are indistinguishable on the wire by design.
    pub async fn authorize(
        &self,
        target_id: &str,
        challenge: &str,
        response: &str,
        author_id: AuthorId,
    ) -> Result<Session, ErrorInfo> {
        let denied = || ErrorInfo::new(names::AUTH_FAILED, "challenge response rejected");
        let entries = self.entries.read().await;
        let entry = entries.get(target_id).ok_or_else(denied)?;
        let expected = challenge_response(&entry.secret, challenge);
        if expected != response {
            return Err(denied());
        }
        let host = Arc::clone(&entry.host);
        drop(entries);
        host.open_session(random_session_id(), author_id)
            .await
            .map_err(|err| ErrorInfo::new(err.wire_name(), err.to_string()))
    }
}
