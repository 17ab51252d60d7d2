//! Append-only log segments.
//!
//! The metadata log persists as numbered segment files under `state/`. Each
//! record is framed as `len (u32 LE) | bincode payload | crc32c (u32 LE)`;
//! appends are fsynced before they count as persisted. Replay stops at the
//! first corrupt record, truncates the file there and discards any later
//! segments, so a torn tail write can never resurrect as garbage.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::types::LogEntry;
use crate::error::Result;
use crate::membership::types::NodeId;

const SEGMENT_ROLL_BYTES: u64 = 4 * 1024 * 1024;
const HARD_STATE_FILE: &str = "hard_state.json";

/// Raft state that must survive a restart: the current term, who we voted
/// for in it, and the snapshot baseline the log sits on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub base_index: u64,
    pub base_term: u64,
    /// Highest index known committed; lets a restart re-apply the view
    /// without waiting to hear from a leader.
    pub commit_index: u64,
}

pub fn load_hard_state(dir: &Path) -> Result<HardState> {
    let path = dir.join(HARD_STATE_FILE);
    if !path.exists() {
        return Ok(HardState::default());
    }
    let raw = fs::read(&path)?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Atomic write: temp + fsync + rename, same as every other durable file
/// in the system.
pub fn save_hard_state(dir: &Path, state: &HardState) -> Result<()> {
    let tmp = dir.join(format!("{HARD_STATE_FILE}.tmp"));
    let dest = dir.join(HARD_STATE_FILE);
    let data = serde_json::to_vec(state)?;
    let mut file = File::create(&tmp)?;
    file.write_all(&data)?;
    file.sync_all()?;
    fs::rename(&tmp, &dest)?;
    Ok(())
}

pub struct LogStorage {
    dir: PathBuf,
    /// Committed and uncommitted entries past the snapshot baseline;
    /// `entries[i].index == base_index + i + 1`.
    entries: Vec<LogEntry>,
    base_index: u64,
    base_term: u64,
    segment_seq: u64,
    writer: File,
    written: u64,
}

impl LogStorage {
    pub fn open(dir: PathBuf, base_index: u64, base_term: u64) -> Result<Self> {
        fs::create_dir_all(&dir)?;

        let mut segment_paths: Vec<(u64, PathBuf)> = fs::read_dir(&dir)?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                let name = path.file_name()?.to_str()?;
                let seq = name
                    .strip_prefix("segment-")?
                    .strip_suffix(".log")?
                    .parse()
                    .ok()?;
                Some((seq, path))
            })
            .collect();
        segment_paths.sort();

        let mut entries = Vec::new();
        let mut truncated = false;
        let mut segment_seq = 1u64;
        for (seq, path) in &segment_paths {
            if truncated {
                warn!("Dropping segment {} past corrupt record", seq);
                fs::remove_file(path)?;
                continue;
            }
            segment_seq = *seq;
            let (mut replayed, valid_len, corrupt) = read_segment(path)?;
            entries.append(&mut replayed);
            if corrupt {
                warn!(
                    "Corrupt tail in segment {}, truncating to {} bytes",
                    seq, valid_len
                );
                OpenOptions::new().write(true).open(path)?.set_len(valid_len)?;
                truncated = true;
            }
        }

        let current = segment_path(&dir, segment_seq);
        let writer = OpenOptions::new().create(true).append(true).open(&current)?;
        let written = writer.metadata()?.len();

        Ok(Self {
            dir,
            entries,
            base_index,
            base_term,
            segment_seq,
            writer,
            written,
        })
    }

    pub fn base_index(&self) -> u64 {
        self.base_index
    }

    pub fn base_term(&self) -> u64 {
        self.base_term
    }

    pub fn last_index(&self) -> u64 {
        self.base_index + self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.base_term)
    }

    pub fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.base_index {
            return None;
        }
        self.entries.get((index - self.base_index - 1) as usize)
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.base_index {
            Some(self.base_term)
        } else {
            self.entry_at(index).map(|e| e.term)
        }
    }

    pub fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        if index <= self.base_index {
            return self.entries.clone();
        }
        let start = (index - self.base_index - 1) as usize;
        self.entries.get(start..).unwrap_or_default().to_vec()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Append one entry durably. The caller guarantees contiguity.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        debug_assert_eq!(entry.index, self.last_index() + 1);

        let payload = bincode::serialize(&entry)?;
        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());

        self.writer.write_all(&frame)?;
        self.writer.sync_all()?;
        self.written += frame.len() as u64;
        self.entries.push(entry);

        if self.written >= SEGMENT_ROLL_BYTES {
            self.roll()?;
        }
        Ok(())
    }

    fn roll(&mut self) -> Result<()> {
        self.segment_seq += 1;
        let path = segment_path(&self.dir, self.segment_seq);
        self.writer = OpenOptions::new().create(true).append(true).open(path)?;
        self.written = 0;
        Ok(())
    }

    /// Drop every entry at `index` and after, rewriting the segments.
    /// Conflict resolution only; committed entries are never truncated.
    pub fn truncate_from(&mut self, index: u64) -> Result<()> {
        let keep = index.saturating_sub(self.base_index + 1) as usize;
        self.entries.truncate(keep);
        self.rewrite_segments()
    }

    /// Replace the log with a snapshot baseline.
    pub fn install_base(&mut self, base_index: u64, base_term: u64) -> Result<()> {
        self.entries.clear();
        self.base_index = base_index;
        self.base_term = base_term;
        self.rewrite_segments()
    }

    fn rewrite_segments(&mut self) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_segment = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("segment-") && n.ends_with(".log"));
            if is_segment {
                fs::remove_file(path)?;
            }
        }

        self.segment_seq = 1;
        let path = segment_path(&self.dir, self.segment_seq);
        self.writer = OpenOptions::new().create(true).append(true).open(path)?;
        self.written = 0;

        let entries = std::mem::take(&mut self.entries);
        for entry in &entries {
            let payload = bincode::serialize(entry)?;
            let mut frame = Vec::with_capacity(payload.len() + 8);
            frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            frame.extend_from_slice(&payload);
            frame.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
            self.writer.write_all(&frame)?;
            self.written += frame.len() as u64;
        }
        self.writer.sync_all()?;
        self.entries = entries;
        Ok(())
    }
}

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("segment-{seq:08}.log"))
}

/// Replay one segment. Returns the entries, the byte offset of the last
/// valid record boundary, and whether a corrupt record was hit.
fn read_segment(path: &Path) -> Result<(Vec<LogEntry>, u64, bool)> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut entries = Vec::new();
    let mut offset = 0u64;

    loop {
        if offset == len {
            return Ok((entries, offset, false));
        }
        file.seek(SeekFrom::Start(offset))?;

        let mut len_buf = [0u8; 4];
        if file.read_exact(&mut len_buf).is_err() {
            return Ok((entries, offset, true));
        }
        let payload_len = u32::from_le_bytes(len_buf) as u64;
        if offset + 4 + payload_len + 4 > len {
            return Ok((entries, offset, true));
        }

        let mut payload = vec![0u8; payload_len as usize];
        if file.read_exact(&mut payload).is_err() {
            return Ok((entries, offset, true));
        }
        let mut crc_buf = [0u8; 4];
        if file.read_exact(&mut crc_buf).is_err() {
            return Ok((entries, offset, true));
        }
        if crc32c::crc32c(&payload) != u32::from_le_bytes(crc_buf) {
            return Ok((entries, offset, true));
        }

        match bincode::deserialize::<LogEntry>(&payload) {
            Ok(entry) => entries.push(entry),
            Err(_) => return Ok((entries, offset, true)),
        }
        offset += 4 + payload_len + 4;
    }
}
