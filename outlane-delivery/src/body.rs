//! Message body sources
//!
//! Headers travel with the delivery and change on every attempt; the body is
//! immutable and fetched separately when the message is streamed.

use std::{collections::HashMap, io::Cursor, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::io::AsyncRead;

/// A message body being read.
pub type Body = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum BodyError {
    #[error("No body stored for message {0}")]
    NotFound(String),

    #[error("Invalid message id {0:?}")]
    InvalidId(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait BodySource: Send + Sync {
    /// Opens the body of message `id` for reading.
    async fn fetch(&self, id: &str) -> Result<Body, BodyError>;
}

/// Reads bodies stored as `<dir>/<id>.body`.
#[derive(Debug, Clone)]
pub struct FileBodySource {
    dir: PathBuf,
}

impl FileBodySource {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Where the body of `id` is stored.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` could escape the body directory.
    pub fn path(&self, id: &str) -> Result<PathBuf, BodyError> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(BodyError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.body")))
    }
}

#[async_trait]
impl BodySource for FileBodySource {
    async fn fetch(&self, id: &str) -> Result<Body, BodyError> {
        let path = self.path(id)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(BodyError::NotFound(id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Bodies held in memory, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryBodySource {
    bodies: Arc<RwLock<HashMap<String, Arc<[u8]>>>>,
}

impl MemoryBodySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.bodies.write().insert(id.into(), Arc::from(body.into()));
    }
}

#[async_trait]
impl BodySource for MemoryBodySource {
    async fn fetch(&self, id: &str) -> Result<Body, BodyError> {
        let body = self
            .bodies
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| BodyError::NotFound(id.to_string()))?;
        Ok(Box::new(Cursor::new(body)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    async fn read(mut body: Body) -> String {
        let mut out = String::new();
        body.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn reads_body_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("18c4a1.body"), "Hello\r\n").unwrap();

        let source = FileBodySource::new(dir.path());
        assert_eq!(read(source.fetch("18c4a1").await.unwrap()).await, "Hello\r\n");
        assert!(matches!(
            source.fetch("missing").await,
            Err(BodyError::NotFound(_))
        ));
    }

    #[test]
    fn ids_cannot_escape_the_directory() {
        let source = FileBodySource::new("/var/spool/outlane");
        for id in ["", "../etc/passwd", "a/b", "..", ".hidden"] {
            assert!(matches!(source.path(id), Err(BodyError::InvalidId(_))), "{id}");
        }
        assert_eq!(
            source.path("abc").unwrap(),
            PathBuf::from("/var/spool/outlane/abc.body")
        );
    }

    #[tokio::test]
    async fn memory_bodies() {
        let source = MemoryBodySource::new();
        source.insert("id", "body");
        assert_eq!(read(source.fetch("id").await.unwrap()).await, "body");
        assert!(source.fetch("other").await.is_err());
    }
}
