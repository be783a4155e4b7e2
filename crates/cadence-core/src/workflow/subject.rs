//! Subject snapshot lookup.
//!
//! Predicates may read `subject.*` paths (e.g. a lead's owner or stage).
//! The engine asks a `SubjectDirectory` for a fresh snapshot each time a
//! condition or action node is evaluated.

use std::collections::HashMap;
use std::sync::RwLock;

use futures_util::future::BoxFuture;
use serde_json::{Value, json};

/// Resolves a subject ID to a JSON snapshot.
pub trait SubjectDirectory: Send + Sync {
    /// `Ok(None)` means the subject is unknown; predicates then see `{}`.
    fn snapshot<'a>(&'a self, subject_id: &'a str) -> BoxFuture<'a, Result<Option<Value>, String>>;
}

/// Directory that knows no subjects.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptySubjectDirectory;

impl SubjectDirectory for EmptySubjectDirectory {
    fn snapshot<'a>(&'a self, _subject_id: &'a str) -> BoxFuture<'a, Result<Option<Value>, String>> {
        Box::pin(async { Ok(None) })
    }
}

/// In-memory directory, for tests and embedding.
#[derive(Debug, Default)]
pub struct StaticSubjectDirectory {
    subjects: RwLock<HashMap<String, Value>>,
}

impl StaticSubjectDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subject_id: impl Into<String>, snapshot: Value) {
        self.subjects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(subject_id.into(), snapshot);
    }
}

impl SubjectDirectory for StaticSubjectDirectory {
    fn snapshot<'a>(&'a self, subject_id: &'a str) -> BoxFuture<'a, Result<Option<Value>, String>> {
        let found = self
            .subjects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(subject_id)
            .cloned();
        Box::pin(async move { Ok(found) })
    }
}

/// Snapshot or `{}` when the subject is unknown.
pub fn snapshot_or_empty(found: Option<Value>) -> Value {
    found.unwrap_or_else(|| json!({}))
}
