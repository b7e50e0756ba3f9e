//! Persisted state
//!
//! Restart recovery lives here: the share forest as rolling chunk files
//! (packed with the share codec, ~1000 shares per file, atomically
//! replaced), the peer cache, the Stratum session cache, and the
//! append-only block history log.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::network::addrstore::AddressEntry;
use crate::primitives::encode::Reader;
use crate::primitives::hash::Hash256;
use crate::share::codec::{pack_share, unpack_share};
use crate::share::Share;
use crate::stratum::VardiffSnapshot;

/// Shares per chunk file
const CHUNK_SIZE: usize = 1000;

/// One found parent block, for the history log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    pub height: u32,
    pub hash: Hash256,
    pub timestamp: u64,
    /// Expected attempts spent per attempt the block needed (1.0 = even)
    pub luck: f64,
}

/// All on-disk state under one data directory
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("shares"))?;
        Ok(Self { root })
    }

    fn shares_dir(&self) -> PathBuf {
        self.root.join("shares")
    }

    fn peers_path(&self) -> PathBuf {
        self.root.join("peers.json")
    }

    fn sessions_path(&self) -> PathBuf {
        self.root.join("sessions.json")
    }

    fn blocks_path(&self) -> PathBuf {
        self.root.join("blocks.jsonl")
    }

    /// Write the whole forest as rolling chunks, atomically per file.
    /// Chunks beyond the current count are removed.
    pub fn save_shares(&self, shares: &[Arc<Share>]) -> std::io::Result<()> {
        let dir = self.shares_dir();
        let chunk_count = shares.len().div_ceil(CHUNK_SIZE);
        for (index, chunk) in shares.chunks(CHUNK_SIZE).enumerate() {
            let mut buf = Vec::new();
            for share in chunk {
                buf.extend_from_slice(&pack_share(share));
            }
            atomic_write(&dir.join(format!("chunk_{:06}.dat", index)), &buf)?;
        }
        // Drop stale chunks from a previously longer forest
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(number) = name
                .strip_prefix("chunk_")
                .and_then(|s| s.strip_suffix(".dat"))
                .and_then(|s| s.parse::<usize>().ok())
            {
                if number >= chunk_count {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
        debug!(shares = shares.len(), chunks = chunk_count, "share chain persisted");
        Ok(())
    }

    /// Load every chunk in order; undecodable tails are dropped with a
    /// warning rather than failing the whole restore.
    pub fn load_shares(&self) -> std::io::Result<Vec<Share>> {
        let dir = self.shares_dir();
        let mut chunk_paths: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().starts_with("chunk_"))
                    .unwrap_or(false)
            })
            .collect();
        chunk_paths.sort();

        let mut shares = Vec::new();
        for path in chunk_paths {
            let bytes = fs::read(&path)?;
            let mut r = Reader::new(&bytes);
            while r.remaining() > 0 {
                match unpack_share(&mut r) {
                    Ok(share) => shares.push(share),
                    Err(e) => {
                        warn!(path = %path.display(), "truncated share chunk: {}", e);
                        break;
                    }
                }
            }
        }
        if !shares.is_empty() {
            info!(count = shares.len(), "share chain restored");
        }
        Ok(shares)
    }

    pub fn save_peers(&self, entries: &[AddressEntry]) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(entries)?;
        atomic_write(&self.peers_path(), &json)
    }

    pub fn load_peers(&self) -> Vec<AddressEntry> {
        read_json_or_default(&self.peers_path())
    }

    pub fn save_sessions(
        &self,
        sessions: &HashMap<String, VardiffSnapshot>,
    ) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(sessions)?;
        atomic_write(&self.sessions_path(), &json)
    }

    pub fn load_sessions(&self) -> HashMap<String, VardiffSnapshot> {
        read_json_or_default(&self.sessions_path())
    }

    /// Append one block to the history log
    pub fn append_block(&self, record: &BlockRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.blocks_path())?;
        file.write_all(&line)
    }

    pub fn load_blocks(&self) -> Vec<BlockRecord> {
        let Ok(content) = fs::read_to_string(self.blocks_path()) else {
            return Vec::new();
        };
        content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

/// Write-then-rename so readers never observe a torn file
fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

fn read_json_or_default<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> T {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => T::default(),
    }
}
