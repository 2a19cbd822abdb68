//! Persisted set of peers that were reachable in earlier runs.
//!
//! Backed by a newline-delimited file of canonical `<multiaddr>/p2p/<id>`
//! strings. The file only grows; duplicate lines written by older versions
//! or by hand collapse into one entry on load.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::types::PeerAddress;

/// Deduplicated, append-only peer address store
pub struct PeerRecordStore {
    path: PathBuf,
    known: Mutex<HashSet<PeerAddress>>,
}

impl PeerRecordStore {
    /// Load the store from `path`. A missing file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut known = HashSet::new();

        if path.exists() {
            let content = fs::read(&path)
                .map_err(|e| anyhow::anyhow!("Failed to read peers file {}: {}", path.display(), e))?;
            let mut skipped = 0usize;
            for line in content.split(|b| *b == b'\n') {
                match std::str::from_utf8(line) {
                    Ok(line) => known.extend(PeerAddress::from_line(line)),
                    Err(_) => skipped += 1,
                }
            }
            if skipped > 0 {
                warn!("Skipped {} unreadable lines in {}", skipped, path.display());
            }
            info!("Loaded {} known peers from {}", known.len(), path.display());
        } else {
            debug!("No peers file at {}, starting empty", path.display());
        }

        Ok(Self {
            path,
            known: Mutex::new(known),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of every known address, in no particular order
    pub fn list(&self) -> Vec<PeerAddress> {
        self.known.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.known.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.lock().is_empty()
    }

    /// Record that `peer_id` was reached at `addr`.
    ///
    /// Returns `Ok(true)` when the address was new and has been appended to
    /// the file, `Ok(false)` when it was already known. The membership check
    /// happens under the lock; the file append does not hold it.
    pub fn add(&self, addr: &Multiaddr, peer_id: &PeerId) -> Result<bool> {
        let record = PeerAddress::new(addr, peer_id);

        if !self.known.lock().insert(record.clone()) {
            return Ok(false);
        }

        self.append(&record)?;
        debug!("Remembered peer {}", record);
        Ok(true)
    }

    fn append(&self, record: &PeerAddress) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options
            .open(&self.path)
            .map_err(|e| anyhow::anyhow!("Failed to open peers file {}: {}", self.path.display(), e))?;
        // One write per record so concurrent appends never interleave
        file.write_all(format!("{}\n", record).as_bytes())?;
        Ok(())
    }
}
