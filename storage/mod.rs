//! Data directory layout and small-file persistence helpers.
//!
//! ```text
//! <root>/
//!   ledger.bin          append-only binary ledger
//!   mirror/             relational mirror tables (one JSON file per table)
//!   mempool.json        durable pending pool
//!   sync_state.json     sync resume marker
//!   keys.json           validator keyring
//!   intake/             raw transaction queue (processed/ holds handled records)
//!   node.lock           advisory lock
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

#[derive(Clone, Debug)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn p(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }

    pub fn ledger_path(&self) -> PathBuf { self.p("ledger.bin") }
    pub fn mirror_dir(&self) -> PathBuf { self.p("mirror") }
    pub fn mempool_path(&self) -> PathBuf { self.p("mempool.json") }
    pub fn sync_state_path(&self) -> PathBuf { self.p("sync_state.json") }
    pub fn keyring_path(&self) -> PathBuf { self.p("keys.json") }
    pub fn lock_path(&self) -> PathBuf { self.p("node.lock") }
}

/// Serialize to `<path>.tmp`, fsync, then rename over `path`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let out = serde_json::to_vec_pretty(value).map_err(|e| {
        io::Error::new(io::ErrorKind::InvalidData, format!("{} encode: {e}", path.display()))
    })?;
    let tmp = path.with_extension("tmp");
    {
        use std::io::Write;
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&out)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Read a JSON file; `Ok(None)` when it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map(Some).map_err(|e| {
        io::Error::new(io::ErrorKind::InvalidData, format!("{} parse: {e}", path.display()))
    })
}
