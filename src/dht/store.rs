//! On-disk persistence of the node identity and known remotes.
//!
//! A small JSON blob keyed by port, so several instances can share a
//! home directory. The node must run fine without disk: every failure
//! here is logged and swallowed.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const APP_DIR: &str = ".rdht";

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct DhtStore {
    pub id: Vec<u8>,
    pub port: u16,
    /// `"host:port"` → 20-byte node id.
    pub remotes: HashMap<String, Vec<u8>>,
    /// Empty when persistence is disabled.
    #[serde(skip)]
    dir: Option<PathBuf>,
}

impl DhtStore {
    /// Loads the store for `port`, or a blank one when persistence is
    /// disabled or the file is missing or unreadable.
    pub fn open(port: u16, enabled: bool) -> Self {
        if !enabled {
            return Self {
                port,
                ..Self::default()
            };
        }
        let dir = store_dir();
        if let Err(err) = fs::create_dir_all(&dir) {
            warn!("cannot create store directory {}: {}", dir.display(), err);
            return Self {
                port,
                ..Self::default()
            };
        }
        Self::open_in(dir, port)
    }

    pub(crate) fn open_in(dir: PathBuf, port: u16) -> Self {
        let mut store = Self {
            port,
            dir: Some(dir),
            ..Self::default()
        };
        let path = store.file_path();
        match fs::read(&path) {
            Ok(data) => match serde_json::from_slice::<DhtStore>(&data) {
                Ok(loaded) => {
                    store.id = loaded.id;
                    store.remotes = loaded.remotes;
                }
                Err(err) => warn!("corrupt store {}: {}", path.display(), err),
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("cannot read store {}: {}", path.display(), err),
        }
        store
    }

    fn file_path(&self) -> PathBuf {
        let dir = self.dir.as_deref().unwrap_or_else(|| Path::new("."));
        dir.join(format!("dht-{}", self.port))
    }

    /// Persists via write-to-temp-then-rename; on a rename collision the
    /// target is deleted and the rename retried.
    pub fn save(&self) {
        let dir = match &self.dir {
            Some(dir) => dir.clone(),
            None => return,
        };
        let path = self.file_path();
        let tmp = match NamedTempFile::new_in(&dir) {
            Ok(tmp) => tmp,
            Err(err) => {
                warn!("store tempfile: {}", err);
                return;
            }
        };
        if let Err(err) = serde_json::to_writer(tmp.as_file(), self) {
            warn!("store json encoding: {}", err);
            return;
        }
        if let Err(persist_err) = tmp.persist(&path) {
            if let Err(err) = fs::remove_file(&path) {
                warn!("store: cannot replace {}: {}", path.display(), err);
                return;
            }
            if let Err(err) = persist_err.file.persist(&path) {
                warn!("store: rename after delete failed: {}", err);
                return;
            }
        }
        debug!("saved DHT routing table to {}", path.display());
    }
}

fn store_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(APP_DIR),
        None => PathBuf::from(APP_DIR),
    }
}
