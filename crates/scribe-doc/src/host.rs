// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! The per-document aggregate: one file, three logs, background tasks.

use std::sync::{Arc, Mutex};

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::info;

use scribe_delta::{AuthorId, SessionId};
use scribe_file::{FrozenBuffer, StoragePath, TransactionSpec, TransactionalFile};
use scribe_proto::Codec;

use crate::caret::CaretControl;
use crate::control::{BodyControl, PropertyControl};
use crate::{DocError, Session};

/// Storage schema this build reads and writes.
const SCHEMA_VERSION: &str = "1";
/// Schema versions an offline migration tool can upgrade in place.
const MIGRATABLE_VERSIONS: [&str; 1] = ["0"];

/// What opening a file concluded about its stored schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStatus {
    /// The schema matches; the file is usable as-is.
    Ok,
    /// The schema is compatible but wants a storage upgrade.
    Migrate,
    /// The schema is unrecognized; the file must not be served.
    Error,
}

/// One open document: the file handle, its three logs, and the caret tasks.
///
/// Mutation serialization is delegated to the file's compare-and-swap;
/// the host itself holds no document-wide lock.
pub struct DocHost {
    file: Arc<dyn TransactionalFile>,
    codec: Codec,
    body: BodyControl,
    property: PropertyControl,
    carets: Arc<CaretControl>,
    status: ValidationStatus,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DocHost {
    /// Opens a document: create-if-missing, schema check, log recovery and
    /// initialization, caret task spawn.
    ///
    /// # Errors
    ///
    /// `BadData` when the stored schema is unrecognized
    /// ([`ValidationStatus::Error`]); storage errors pass through.
    pub async fn open(
        file: Arc<dyn TransactionalFile>,
        codec: Codec,
    ) -> Result<Arc<Self>, DocError> {
        if !file.exists().await? {
            file.create().await?;
        }
        let status = Self::check_schema(&file).await?;
        if status == ValidationStatus::Error {
            return Err(DocError::BadData(format!(
                "{} has an unrecognized schema version",
                file.doc_path()
            )));
        }
        let body = BodyControl::body(Arc::clone(&file), codec)?;
        body.recover().await?;
        body.init_if_missing().await?;
        let property = PropertyControl::property(Arc::clone(&file), codec)?;
        property.recover().await?;
        property.init_if_missing().await?;
        let carets = Arc::new(CaretControl::new(Arc::clone(&file), codec));
        let tasks = carets.spawn_tasks();
        info!(doc = file.doc_path(), ?status, "document opened");
        Ok(Arc::new(Self {
            file,
            codec,
            body,
            property,
            carets,
            status,
            tasks: Mutex::new(tasks),
        }))
    }

    async fn check_schema(
        file: &Arc<dyn TransactionalFile>,
    ) -> Result<ValidationStatus, DocError> {
        let path = StoragePath::new("/schema_version")?;
        let result = file
            .transact(TransactionSpec::new().read_path(path.clone()))
            .await?;
        match result.data.get(&path) {
            None => {
                // Fresh file: stamp it.
                file.transact(
                    TransactionSpec::new()
                        .check_path_absent(path.clone())
                        .write_path(path, FrozenBuffer::from_string(SCHEMA_VERSION)),
                )
                .await
                .or_else(|err| match err {
                    // A racing opener stamped it first.
                    scribe_file::FileError::PrerequisiteFailed(_) => {
                        Ok(scribe_file::TransactionResult::default())
                    }
                    other => Err(other),
                })?;
                Ok(ValidationStatus::Ok)
            }
            Some(buf) => {
                let stored = buf.as_utf8()?;
                if stored == SCHEMA_VERSION {
                    Ok(ValidationStatus::Ok)
                } else if MIGRATABLE_VERSIONS.contains(&stored) {
                    Ok(ValidationStatus::Migrate)
                } else {
                    Ok(ValidationStatus::Error)
                }
            }
        }
    }

    /// Identification string for logs.
    pub fn doc_path(&self) -> &str {
        self.file.doc_path()
    }

    /// The codec shared by this document's encodings.
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// What the schema check concluded at open time.
    pub fn validation_status(&self) -> ValidationStatus {
        self.status
    }

    /// The body log.
    pub fn body(&self) -> &BodyControl {
        &self.body
    }

    /// The property log.
    pub fn property(&self) -> &PropertyControl {
        &self.property
    }

    /// The caret log.
    pub fn carets(&self) -> &CaretControl {
        &self.carets
    }

    /// Opens a session: begins its caret at the current body revision.
    pub async fn open_session(
        self: &Arc<Self>,
        session_id: SessionId,
        author_id: AuthorId,
    ) -> Result<Session, DocError> {
        let doc_rev = self.body.current_rev_num().await?;
        self.carets
            .begin_session(session_id.clone(), author_id.clone(), doc_rev)
            .await?;
        Ok(Session::new(Arc::clone(self), session_id, author_id))
    }

    /// Ends a session's caret. Idempotent.
    pub async fn close_session(&self, session_id: &SessionId) {
        self.carets.end_session(session_id).await;
    }

    /// Aborts the background caret tasks. Partial flushes are fine.
    pub fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl Drop for DocHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A fresh 16-character alphanumeric session id.
pub fn random_session_id() -> SessionId {
    loop {
        let raw: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        if let Ok(sid) = SessionId::new(raw) {
            return sid;
        }
    }
}
