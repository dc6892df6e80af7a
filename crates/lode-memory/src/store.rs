// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory file not found: {0}")]
    NotFound(String),
    #[error("invalid memory path: {0}")]
    InvalidPath(String),
    #[error("memory io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Session-scoped file storage capability backing the working memory.
///
/// Paths are relative, slash-separated namespaces (`sessions/<id>/plan.md`).
/// Writers are serialized by the implementation.
pub trait FileStore: Send + Sync {
    fn read(&self, path: &str) -> Result<String, MemoryError>;
    fn write(&self, path: &str, content: &str) -> Result<(), MemoryError>;
    fn append(&self, path: &str, content: &str) -> Result<(), MemoryError>;
    fn exists(&self, path: &str) -> bool;
}

/// In-memory store; the authoritative backend for tests.
#[derive(Default)]
pub struct MemoryFileStore {
    files: Mutex<HashMap<String, String>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileStore for MemoryFileStore {
    fn read(&self, path: &str) -> Result<String, MemoryError> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| MemoryError::NotFound(path.to_string()))
    }

    fn write(&self, path: &str, content: &str) -> Result<(), MemoryError> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    fn append(&self, path: &str, content: &str) -> Result<(), MemoryError> {
        self.files
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_str(content);
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }
}

/// Disk-backed store rooted at a directory; files are UTF-8 documents.
pub struct DiskFileStore {
    root: PathBuf,
    // One writer at a time; fine-grained per-file locking buys nothing at
    // this write rate.
    guard: Mutex<()>,
}

impl DiskFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            guard: Mutex::new(()),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, MemoryError> {
        let rel = Path::new(path);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(MemoryError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(rel))
    }

    fn io_err(path: &str, source: std::io::Error) -> MemoryError {
        if source.kind() == std::io::ErrorKind::NotFound {
            MemoryError::NotFound(path.to_string())
        } else {
            MemoryError::Io {
                path: path.to_string(),
                source,
            }
        }
    }
}

impl FileStore for DiskFileStore {
    fn read(&self, path: &str) -> Result<String, MemoryError> {
        let full = self.resolve(path)?;
        std::fs::read_to_string(&full).map_err(|e| Self::io_err(path, e))
    }

    fn write(&self, path: &str, content: &str) -> Result<(), MemoryError> {
        let full = self.resolve(path)?;
        let _guard = self.guard.lock().unwrap();
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Self::io_err(path, e))?;
        }
        std::fs::write(&full, content).map_err(|e| Self::io_err(path, e))
    }

    fn append(&self, path: &str, content: &str) -> Result<(), MemoryError> {
        let full = self.resolve(path)?;
        let _guard = self.guard.lock().unwrap();
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Self::io_err(path, e))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full)
            .map_err(|e| Self::io_err(path, e))?;
        file.write_all(content.as_bytes())
            .map_err(|e| Self::io_err(path, e))
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.is_file()).unwrap_or(false)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
