//! Knowledge-base change detection.
//!
//! Walks the knowledge directory for `.md` and `.txt` files and keeps a
//! fingerprint per file in `knowledge_index.json`, so only new or modified
//! documents are re-embedded on startup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::Result;

pub const SUPPORTED_EXTENSIONS: &[&str] = &["md", "txt"];

const INDEX_FILE: &str = "knowledge_index.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub file_path: String,
    pub file_name: String,
    pub file_hash: String,
    pub file_size: u64,
    /// Seconds since the Unix epoch.
    pub modification_time: f64,
    pub document_type: String,
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub chunks_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanStats {
    pub total_files: usize,
    pub processed_files: usize,
    pub pending_files: usize,
    pub total_chunks: usize,
}

/// Outcome of a scan: files to (re)embed and files that disappeared.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub changed: Vec<DocumentInfo>,
    pub removed: Vec<String>,
}

pub struct KnowledgeScanner {
    source_dir: PathBuf,
    index_path: PathBuf,
    processed: BTreeMap<String, DocumentInfo>,
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SUPPORTED_EXTENSIONS.contains(&e.to_lowercase().as_str()))
}

fn file_hash(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

fn mtime_secs(meta: &std::fs::Metadata) -> f64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl KnowledgeScanner {
    /// Open the scanner, loading the persisted fingerprint index if present.
    /// A corrupt index is discarded with a warning.
    pub fn new(source_dir: impl Into<PathBuf>, index_dir: impl AsRef<Path>) -> Self {
        let index_path = index_dir.as_ref().join(INDEX_FILE);
        let processed = match std::fs::read(&index_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %index_path.display(), "ignoring unreadable knowledge index: {e}");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self {
            source_dir: source_dir.into(),
            index_path,
            processed,
        }
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    /// Chunk source label for a scanned file: its path relative to the
    /// knowledge directory.
    pub fn source_label(&self, file_path: &str) -> String {
        let path = Path::new(file_path);
        path.strip_prefix(&self.source_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    fn supported_files(&self) -> Vec<PathBuf> {
        if !self.source_dir.exists() {
            return Vec::new();
        }
        let mut files: Vec<PathBuf> = WalkDir::new(&self.source_dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_supported(e.path()))
            .map(|e| e.into_path())
            .collect();
        files.sort();
        files
    }

    fn describe(path: &Path) -> Result<DocumentInfo> {
        let meta = std::fs::metadata(path)?;
        Ok(DocumentInfo {
            file_path: path.to_string_lossy().into_owned(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            file_hash: file_hash(path)?,
            file_size: meta.len(),
            modification_time: mtime_secs(&meta),
            document_type: path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default(),
            processed: false,
            chunks_count: 0,
        })
    }

    /// Find new and modified files, forget deleted ones, and persist the index.
    pub fn scan(&mut self) -> Result<ScanResult> {
        let mut result = ScanResult::default();
        let mut seen = Vec::new();

        for path in self.supported_files() {
            seen.push(path.to_string_lossy().into_owned());
            let info = match Self::describe(&path) {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "cannot fingerprint knowledge file: {e}");
                    continue;
                }
            };
            let changed = match self.processed.get(&info.file_path) {
                None => {
                    tracing::info!(file = %info.file_name, "new knowledge file");
                    true
                }
                Some(old) if old.file_hash != info.file_hash || !old.processed => {
                    tracing::info!(file = %info.file_name, "knowledge file changed");
                    true
                }
                Some(_) => false,
            };
            if changed {
                self.processed.insert(info.file_path.clone(), info.clone());
                result.changed.push(info);
            }
        }

        let removed: Vec<String> = self
            .processed
            .keys()
            .filter(|k| !seen.contains(k))
            .cloned()
            .collect();
        for key in &removed {
            tracing::info!(file = %key, "knowledge file removed");
            self.processed.remove(key);
        }
        result.removed = removed;

        if !result.changed.is_empty() || !result.removed.is_empty() {
            self.save()?;
        }
        Ok(result)
    }

    /// Cheap check on size and mtime only; no hashing.
    pub fn has_changes(&self) -> bool {
        let files = self.supported_files();
        if files.len() != self.processed.len() {
            return true;
        }
        files.iter().any(|path| {
            let key = path.to_string_lossy();
            let Some(stored) = self.processed.get(key.as_ref()) else {
                return true;
            };
            match std::fs::metadata(path) {
                Ok(meta) => {
                    !stored.processed
                        || stored.file_size != meta.len()
                        || (stored.modification_time - mtime_secs(&meta)).abs() > 1e-6
                }
                Err(_) => true,
            }
        })
    }

    /// All supported files, regardless of the index, for a full rebuild.
    pub fn all_documents(&mut self) -> Result<Vec<DocumentInfo>> {
        self.processed.clear();
        let mut docs = Vec::new();
        for path in self.supported_files() {
            let info = match Self::describe(&path) {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "cannot fingerprint knowledge file: {e}");
                    continue;
                }
            };
            self.processed.insert(info.file_path.clone(), info.clone());
            docs.push(info);
        }
        Ok(docs)
    }

    pub fn read_document(&self, doc: &DocumentInfo) -> Result<String> {
        Ok(std::fs::read_to_string(&doc.file_path)?)
    }

    pub fn mark_processed(&mut self, file_path: &str, chunks_count: usize) -> Result<()> {
        if let Some(doc) = self.processed.get_mut(file_path) {
            doc.processed = true;
            doc.chunks_count = chunks_count;
            self.save()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> ScanStats {
        let total_files = self.processed.len();
        let processed_files = self.processed.values().filter(|d| d.processed).count();
        ScanStats {
            total_files,
            processed_files,
            pending_files: total_files - processed_files,
            total_chunks: self
                .processed
                .values()
                .filter(|d| d.processed)
                .map(|d| d.chunks_count)
                .sum(),
        }
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.index_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.index_path, serde_json::to_vec_pretty(&self.processed)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dirs() -> (PathBuf, PathBuf) {
        let root = std::env::temp_dir().join(format!("zhiji-scan-{}", uuid::Uuid::now_v7()));
        let kb = root.join("kb");
        std::fs::create_dir_all(kb.join("nested")).unwrap();
        (kb, root.join("index"))
    }

    #[test]
    fn test_scan_detects_new_changed_and_removed() {
        let (kb, index) = temp_dirs();
        std::fs::write(kb.join("焦虑.md"), "焦虑的常见表现").unwrap();
        std::fs::write(kb.join("nested").join("sleep.txt"), "睡眠卫生").unwrap();
        std::fs::write(kb.join("ignored.pdf"), "binary").unwrap();

        let mut scanner = KnowledgeScanner::new(&kb, &index);
        let first = scanner.scan().unwrap();
        assert_eq!(first.changed.len(), 2);
        for doc in &first.changed {
            scanner.mark_processed(&doc.file_path, 1).unwrap();
        }
        assert!(!scanner.has_changes());

        // unchanged rescan from a fresh scanner reading the persisted index
        let mut reopened = KnowledgeScanner::new(&kb, &index);
        assert!(reopened.scan().unwrap().changed.is_empty());
        assert_eq!(reopened.stats().total_chunks, 2);

        std::fs::write(kb.join("焦虑.md"), "焦虑的常见表现，以及应对方法").unwrap();
        std::fs::remove_file(kb.join("nested").join("sleep.txt")).unwrap();
        assert!(reopened.has_changes());
        let second = reopened.scan().unwrap();
        assert_eq!(second.changed.len(), 1);
        assert_eq!(second.changed[0].file_name, "焦虑.md");
        assert_eq!(second.removed.len(), 1);

        let _ = std::fs::remove_dir_all(kb.parent().unwrap());
    }

    #[test]
    fn test_source_label_is_relative() {
        let scanner = KnowledgeScanner::new("/kb", std::env::temp_dir());
        assert_eq!(scanner.source_label("/kb/nested/sleep.txt"), "nested/sleep.txt");
        assert_eq!(scanner.source_label("/other/a.md"), "/other/a.md");
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let mut scanner = KnowledgeScanner::new("/nonexistent/zhiji-kb", std::env::temp_dir());
        assert!(scanner.scan().unwrap().changed.is_empty());
        assert!(!scanner.has_changes());
    }

    #[test]
    fn test_stats_counts_pending() {
        let (kb, index) = temp_dirs();
        std::fs::write(kb.join("a.md"), "a").unwrap();
        std::fs::write(kb.join("b.md"), "b").unwrap();
        let mut scanner = KnowledgeScanner::new(&kb, &index);
        let docs = scanner.scan().unwrap().changed;
        scanner.mark_processed(&docs[0].file_path, 3).unwrap();
        let stats = scanner.stats();
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.processed_files, 1);
        assert_eq!(stats.pending_files, 1);
        assert_eq!(stats.total_chunks, 3);
        let _ = std::fs::remove_dir_all(kb.parent().unwrap());
    }
}
