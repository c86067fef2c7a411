// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! RPC targets: named endpoints callable over a connection.

use async_trait::async_trait;
use serde_json::Value;

use scribe_doc::Session;
use scribe_proto::ErrorInfo;

/// A named RPC endpoint.
///
/// Implementations expose their own method tables; the connection layer
/// only guards the generic rules (no underscore-prefixed names, no calls on
/// uninstalled targets).
#[async_trait]
pub trait Target: Send + Sync {
    /// Invokes `method` with codec-encoded `args`.
    async fn call(&self, method: &str, args: &[Value]) -> Result<Value, ErrorInfo>;

    /// Releases per-connection resources when the owning connection closes.
    async fn close(&self) {}
}

/// A document [`Session`] exposed as a target.
pub struct SessionTarget {
    session: Session,
}

impl SessionTarget {
    /// Wraps a session.
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// The wrapped session.
    pub fn session(&self) -> &Session {
        &self.session
    }
}

#[async_trait]
impl Target for SessionTarget {
    async fn call(&self, method: &str, args: &[Value]) -> Result<Value, ErrorInfo> {
        self.session
            .dispatch(method, args)
            .await
            .map_err(|err| ErrorInfo::new(err.wire_name(), err.to_string()))
    }

    async fn close(&self) {
        self.session.close().await;
    }
}
