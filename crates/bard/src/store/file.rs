//! Directory-backed durable store.
//!
//! One subdirectory per table, one file per record. Writes go to a
//! temporary file that is renamed into place, so a record is either the old
//! bytes or the new bytes, never a torn write.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{BardError, Result};

use super::{DurableStore, TxnLatch};

/// A [`DurableStore`] rooted at a directory.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    txn: TxnLatch,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| BardError::io(root.display().to_string(), e))?;
        debug!("file store opened at {}", root.display());
        Ok(Self {
            root,
            txn: TxnLatch::default(),
        })
    }

    fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join(table)
    }

    fn record_path(&self, table: &str, key: &str) -> PathBuf {
        self.table_dir(table).join(encode_key(key))
    }

    fn write_record(&self, path: &Path, value: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value).map_err(|e| BardError::io(tmp.display().to_string(), e))?;
        fs::rename(&tmp, path).map_err(|e| BardError::io(path.display().to_string(), e))?;
        Ok(())
    }
}

/// Keys may hold spaces, slashes and separator characters; encode everything
/// outside a conservative set so they are safe as file names.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' | b'_' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(name.len());
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hi = chars.next()?;
            let lo = chars.next()?;
            bytes.push(u8::from_str_radix(&format!("{hi}{lo}"), 16).ok()?);
        } else {
            bytes.push(c as u8);
        }
    }
    String::from_utf8(bytes).ok()
}

impl DurableStore for FileStore {
    fn begin_transaction(&self) {
        self.txn.acquire();
    }

    fn end_transaction(&self) {
        self.txn.release();
    }

    fn add(&self, table: &str, key: &str, value: &[u8]) -> Result<()> {
        let dir = self.table_dir(table);
        fs::create_dir_all(&dir).map_err(|e| BardError::io(dir.display().to_string(), e))?;

        let path = self.record_path(table, key);
        if path.exists() {
            return Err(BardError::StoreKeyExists(key.to_string()));
        }
        self.write_record(&path, value)
    }

    fn update(&self, table: &str, key: &str, value: &[u8]) -> Result<()> {
        let path = self.record_path(table, key);
        if !path.exists() {
            return Err(BardError::StoreKeyNotFound(key.to_string()));
        }
        self.write_record(&path, value)
    }

    fn del(&self, table: &str, key: &str) -> Result<bool> {
        let path = self.record_path(table, key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BardError::io(path.display().to_string(), e)),
        }
    }

    fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.record_path(table, key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BardError::io(path.display().to_string(), e)),
        }
    }

    fn keys(&self, table: &str) -> Result<Vec<String>> {
        let dir = self.table_dir(table);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BardError::io(dir.display().to_string(), e)),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BardError::io(dir.display().to_string(), e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".tmp") {
                continue;
            }
            if let Some(key) = decode_key(&name) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_encoding_round_trip() {
        for key in ["dst_ipn_                 977", "src_dtn_//alpha/mail    ", "1_4_6"] {
            let encoded = encode_key(key);
            assert!(!encoded.contains(' '));
            assert!(!encoded.contains('/'));
            assert_eq!(decode_key(&encoded).as_deref(), Some(key));
        }
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path().join("db")).unwrap();
            store.begin_transaction();
            store.add("bardquota", "dst_ipn_ 977", b"rec1").unwrap();
            store.add("bardquota", "src_ipn_   7", b"rec2").unwrap();
            store.end_transaction();
        }

        let store = FileStore::open(dir.path().join("db")).unwrap();
        assert_eq!(
            store.keys("bardquota").unwrap(),
            vec!["dst_ipn_ 977".to_string(), "src_ipn_   7".to_string()]
        );
        assert_eq!(
            store.get("bardquota", "dst_ipn_ 977").unwrap().as_deref(),
            Some(&b"rec1"[..])
        );
    }

    #[test]
    fn add_rejects_existing_update_rejects_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.add("t", "k", b"a").unwrap();
        assert!(matches!(
            store.add("t", "k", b"b"),
            Err(BardError::StoreKeyExists(_))
        ));
        assert!(matches!(
            store.update("t", "other", b"b"),
            Err(BardError::StoreKeyNotFound(_))
        ));
        assert!(store.del("t", "k").unwrap());
        assert_eq!(store.get("t", "k").unwrap(), None);
    }
}
