// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The crash-safe, append-only session log.
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::RunError;
use crate::message::{Message, Role};

const STALE_LOCK_AGE: Duration = Duration::from_secs(30 * 60);
const LOCK_WAIT_BOUND: Duration = Duration::from_secs(10);
const LOCK_BACKOFF_CAP: Duration = Duration::from_secs(1);

/// One persisted JSONL line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEntry {
    Session {
        version: u32,
        id: String,
        timestamp: i64,
        cwd: String,
    },
    Message {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        timestamp: i64,
        message: Message,
    },
    Compaction {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        timestamp: i64,
        summary: Message,
        #[serde(rename = "firstKeptEntryId")]
        first_kept_entry_id: String,
        #[serde(rename = "tokensBefore")]
        tokens_before: usize,
    },
}

impl SessionEntry {
    fn id(&self) -> &str {
        match self {
            SessionEntry::Session { id, .. } => id,
            SessionEntry::Message { id, .. } => id,
            SessionEntry::Compaction { id, .. } => id,
        }
    }

    fn parent_id(&self) -> Option<&str> {
        match self {
            SessionEntry::Session { .. } => None,
            SessionEntry::Message { parent_id, .. } => parent_id.as_deref(),
            SessionEntry::Compaction { parent_id, .. } => parent_id.as_deref(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockMeta {
    pid: u32,
    #[serde(rename = "createdAt")]
    created_at: chrono::DateTime<chrono::Utc>,
}

struct LockGuard {
    file: std::fs::File,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Cached in-memory state for one session.
struct CachedState {
    header: Option<(u32, String, i64, String)>,
    entries: Vec<SessionEntry>,
    by_id: HashMap<String, usize>,
    leaf_id: Option<String>,
    /// `false` until the file has been written at least once; the first
    /// append rewrites the whole file, subsequent ones are pure appends.
    flushed: bool,
    /// `true` when the on-disk file predates the `session` header format and
    /// must be rewritten in full on the next write.
    needs_migration: bool,
    /// `true` once an `assistant`-role message has been appended. `persist`
    /// skips the physical write until this is set, so a session that is
    /// abandoned after only `user` turns leaves no file on disk.
    has_assistant: bool,
}

impl CachedState {
    fn empty() -> Self {
        Self {
            header: None,
            entries: Vec::new(),
            by_id: HashMap::new(),
            leaf_id: None,
            flushed: false,
            needs_migration: false,
            has_assistant: false,
        }
    }
}

/// The append-only session log, keyed by `sessionKey`.
pub struct SessionLog {
    base_dir: PathBuf,
    states: Mutex<HashMap<String, CachedState>>,
}

impl SessionLog {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            states: Mutex::new(HashMap::new()),
        }
    }

    fn file_path(&self, session_key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.jsonl", encode_session_key(session_key)))
    }

    fn lock_path(file_path: &Path) -> PathBuf {
        let mut s = file_path.as_os_str().to_os_string();
        s.push(".lock");
        PathBuf::from(s)
    }

    /// Walk `parentId` from `leaf_id` to the root, returning entries in
    /// root-to-leaf order.
    fn chain<'a>(state: &'a CachedState) -> Vec<&'a SessionEntry> {
        let mut rev = Vec::new();
        let mut cur = state.leaf_id.clone();
        while let Some(id) = cur {
            let Some(&idx) = state.by_id.get(&id) else { break };
            let entry = &state.entries[idx];
            rev.push(entry);
            cur = entry.parent_id().map(|s| s.to_string());
        }
        rev.reverse();
        rev
    }

    /// Load the reconstructed message sequence for a session, applying
    /// compaction checkpoints along the path.
    pub fn load(&self, session_key: &str) -> anyhow::Result<Vec<Message>> {
        Ok(self
            .load_with_ids(session_key)?
            .into_iter()
            .map(|(_, m)| m)
            .collect())
    }

    /// Like [`load`][Self::load] but also returns each live message's entry
    /// id, so callers (the compaction layer) can pin a `firstKeptEntryId`
    /// without needing a separate message-identity lookup.
    pub fn load_with_ids(&self, session_key: &str) -> anyhow::Result<Vec<(String, Message)>> {
        let mut states = self.states.lock().expect("SessionLog states poisoned");
        let state = self.get_or_load(&mut states, session_key)?;
        let chain = Self::chain(state);

        let mut out: Vec<(String, Message)> = Vec::new();
        let mut pos_by_id: HashMap<String, usize> = HashMap::new();
        for entry in chain {
            match entry {
                SessionEntry::Session { .. } => {}
                SessionEntry::Message { id, message, .. } => {
                    pos_by_id.insert(id.clone(), out.len());
                    out.push((id.clone(), message.clone()));
                }
                SessionEntry::Compaction {
                    id,
                    summary,
                    first_kept_entry_id,
                    ..
                } => {
                    let cut = pos_by_id.get(first_kept_entry_id).copied().unwrap_or(0);
                    out.truncate(cut);
                    pos_by_id.insert(id.clone(), out.len());
                    out.push((id.clone(), summary.clone()));
                }
            }
        }
        Ok(out)
    }

    /// Append a message, linking it to the current leaf. Returns the new
    /// entry's id.
    pub fn append(&self, session_key: &str, message: Message) -> anyhow::Result<String> {
        let mut states = self.states.lock().expect("SessionLog states poisoned");
        self.get_or_load(&mut states, session_key)?;
        let state = states.get_mut(session_key).expect("just loaded");

        let id = gen_entry_id();
        if message.role == Role::Assistant {
            state.has_assistant = true;
        }
        let entry = SessionEntry::Message {
            id: id.clone(),
            parent_id: state.leaf_id.clone(),
            timestamp: now_ms(),
            message,
        };
        state.entries.push(entry);
        state.by_id.insert(id.clone(), state.entries.len() - 1);
        state.leaf_id = Some(id.clone());
        self.persist(session_key, state)?;
        Ok(id)
    }

    /// Append a compaction checkpoint.
    pub fn append_compaction(
        &self,
        session_key: &str,
        summary: Message,
        first_kept_entry_id: &str,
        tokens_before: usize,
    ) -> anyhow::Result<String> {
        let mut states = self.states.lock().expect("SessionLog states poisoned");
        self.get_or_load(&mut states, session_key)?;
        let state = states.get_mut(session_key).expect("just loaded");

        let id = gen_entry_id();
        let entry = SessionEntry::Compaction {
            id: id.clone(),
            parent_id: state.leaf_id.clone(),
            timestamp: now_ms(),
            summary,
            first_kept_entry_id: first_kept_entry_id.to_string(),
            tokens_before,
        };
        state.entries.push(entry);
        state.by_id.insert(id.clone(), state.entries.len() - 1);
        state.leaf_id = Some(id.clone());
        self.persist(session_key, state)?;
        Ok(id)
    }

    /// Delete the on-disk log and forget the cached state for a session
    /// (used when a caller wants to start a session over).
    pub fn clear(&self, session_key: &str) -> anyhow::Result<()> {
        let mut states = self.states.lock().expect("SessionLog states poisoned");
        states.remove(session_key);
        let path = self.file_path(session_key);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// List every session key with a log file under the base directory.
    pub fn list(&self) -> anyhow::Result<Vec<String>> {
        let mut keys = Vec::new();
        if !self.base_dir.exists() {
            return Ok(keys);
        }
        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".jsonl") {
                keys.push(decode_session_key(stem));
            }
        }
        Ok(keys)
    }

    // ── Internal load/persist machinery ────────────────────────────────────

    fn get_or_load<'a>(
        &self,
        states: &'a mut HashMap<String, CachedState>,
        session_key: &str,
    ) -> anyhow::Result<&'a mut CachedState> {
        if !states.contains_key(session_key) {
            let loaded = self.read_from_disk(session_key)?;
            states.insert(session_key.to_string(), loaded);
        }
        Ok(states.get_mut(session_key).expect("just inserted"))
    }

    fn read_from_disk(&self, session_key: &str) -> anyhow::Result<CachedState> {
        let path = self.file_path(session_key);
        if !path.exists() {
            return Ok(CachedState::empty());
        }
        let mut text = String::new();
        std::fs::File::open(&path)?.read_to_string(&mut text)?;

        let mut lines = text.lines();
        let first = lines.next();
        let first_parsed: Option<SessionEntry> =
            first.and_then(|l| serde_json::from_str(l).ok());

        match first_parsed {
            Some(SessionEntry::Session { version, id, timestamp, cwd }) => {
                let mut entries = Vec::new();
                for line in lines {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<SessionEntry>(line) {
                        Ok(entry) => entries.push(entry),
                        // Malformed, truncated (e.g. a crash mid-write), or an
                        // unknown entry type from a future format: skip and
                        // continue.
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "skipping malformed session log line");
                        }
                    }
                }
                let leaf_id = entries.last().map(|e| e.id().to_string());
                let by_id = entries
                    .iter()
                    .enumerate()
                    .map(|(i, e)| (e.id().to_string(), i))
                    .collect();
                Ok(CachedState {
                    header: Some((version, id, timestamp, cwd)),
                    entries,
                    by_id,
                    leaf_id,
                    flushed: true,
                    needs_migration: false,
                    // The file already exists on disk, so the deferred-creation
                    // rule has nothing left to enforce for this session.
                    has_assistant: true,
                })
            }
            _ => {
                // No recognizable `session` header: treat the file as a legacy
                // flat message list, one `Message` per line, and schedule a
                // migration to the current format on the next write.
                let mut entries = Vec::new();
                let mut parent_id: Option<String> = None;
                for line in text.lines() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let Ok(message) = serde_json::from_str::<Message>(line) else {
                        tracing::warn!(path = %path.display(), "skipping unparseable legacy log line");
                        continue;
                    };
                    let id = gen_entry_id();
                    entries.push(SessionEntry::Message {
                        id: id.clone(),
                        parent_id: parent_id.clone(),
                        timestamp: message.timestamp,
                        message,
                    });
                    parent_id = Some(id);
                }
                let leaf_id = entries.last().map(|e| e.id().to_string());
                let by_id = entries
                    .iter()
                    .enumerate()
                    .map(|(i, e)| (e.id().to_string(), i))
                    .collect();
                Ok(CachedState {
                    header: None,
                    entries,
                    by_id,
                    leaf_id,
                    flushed: false,
                    needs_migration: true,
                    has_assistant: true,
                })
            }
        }
    }

    fn persist(&self, session_key: &str, state: &mut CachedState) -> anyhow::Result<()> {
        if !state.has_assistant {
            // Keep buffering in memory; don't create a file for a session
            // that has only ever seen `user` turns.
            return Ok(());
        }
        let path = self.file_path(session_key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock = acquire_lock(&Self::lock_path(&path))?;

        if !state.flushed || state.needs_migration {
            let header = state.header.clone().unwrap_or_else(|| {
                (
                    1,
                    Uuid::new_v4().simple().to_string(),
                    now_ms(),
                    std::env::current_dir()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                )
            });
            state.header = Some(header.clone());
            let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
            let (version, id, timestamp, cwd) = header;
            writeln!(
                file,
                "{}",
                serde_json::to_string(&SessionEntry::Session { version, id, timestamp, cwd })?
            )?;
            for entry in &state.entries {
                writeln!(file, "{}", serde_json::to_string(entry)?)?;
            }
            file.sync_all()?;
            state.flushed = true;
            state.needs_migration = false;
        } else {
            let last = state.entries.last().expect("append always pushes before persist");
            let mut file = OpenOptions::new().append(true).create(true).open(&path)?;
            writeln!(file, "{}", serde_json::to_string(last)?)?;
            file.sync_all()?;
        }
        drop(lock);
        Ok(())
    }
}

fn gen_entry_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Percent-encode a session key into a filesystem-safe, reversible form.
/// Only `[A-Za-z0-9._-]` pass through unescaped, so no path separator or
/// traversal sequence can reach the filesystem.
fn encode_session_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn decode_session_key(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(v) = u8::from_str_radix(&encoded[i + 1..i + 3], 16) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Acquire the cross-process advisory lock, removing it first if stale
/// — older than 30 minutes, or its recorded owner pid is no
/// longer alive. Waits up to 10s with backoff capped at 1s.
fn acquire_lock(lock_path: &Path) -> Result<LockGuard, RunError> {
    let start = Instant::now();
    let mut backoff = Duration::from_millis(50);
    loop {
        if let Some(meta) = read_lock_meta(lock_path) {
            if is_stale(&meta) {
                let _ = std::fs::remove_file(lock_path);
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|e| RunError::SessionLockTimeout(e.to_string()))?;

        if FileExt::try_lock_exclusive(&file).is_ok() {
            let meta = LockMeta {
                pid: std::process::id(),
                created_at: chrono::Utc::now(),
            };
            let _ = file.set_len(0);
            let mut f = &file;
            let _ = f.write_all(serde_json::to_string(&meta).unwrap_or_default().as_bytes());
            let _ = f.sync_all();
            return Ok(LockGuard {
                file,
                path: lock_path.to_path_buf(),
            });
        }

        if start.elapsed() > LOCK_WAIT_BOUND {
            return Err(RunError::SessionLockTimeout(format!(
                "{} still held after 10s",
                lock_path.display()
            )));
        }
        std::thread::sleep(backoff);
        backoff = (backoff * 2).min(LOCK_BACKOFF_CAP);
    }
}

fn read_lock_meta(lock_path: &Path) -> Option<LockMeta> {
    let mut text = String::new();
    std::fs::File::open(lock_path).ok()?.read_to_string(&mut text).ok()?;
    serde_json::from_str(&text).ok()
}

fn is_stale(meta: &LockMeta) -> bool {
    let age = chrono::Utc::now().signed_duration_since(meta.created_at);
    if age.to_std().map(|d| d > STALE_LOCK_AGE).unwrap_or(true) {
        return true;
    }
    !pid_is_alive(meta.pid)
}

/// Best-effort liveness probe. Linux-specific (`/proc/<pid>` existence); on
/// other platforms conservatively assumes the owner is still alive so a lock
/// is only ever force-removed by age.
#[cfg(target_os = "linux")]
fn pid_is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}
