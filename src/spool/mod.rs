//-
// Copyright (c) 2025, Jason Lingle
//
// This file is part of Graphgate.
//
// Graphgate is free software: you can  redistribute it and/or modify it under
// the terms  of the GNU General  Public License as published  by the Free
// Software Foundation, either version 3 of  the License, or (at your option)
// any later version.
//
// Graphgate is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY;  without even the  implied warranty of  MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Graphgate. If not, see <http://www.gnu.org/licenses/>.

//! The durable outbound queue.
//!
//! Every message SMTP has accepted but Graph has not is one file named
//! `<timestamp-ns>-<random>.msg` in the queue directory: a little-endian
//! u16 length prefix, a CBOR header (envelope, enqueue time, attempt
//! bookkeeping), then the raw RFC 5322 bytes. Lexicographic filename order
//! is enqueue order. Enqueue stages a temp file and renames it into place,
//! so a crash never leaves a half-written entry visible.
//!
//! In-flight entries are renamed to `*.sending`; permanent failures move
//! to `failed/`. At startup any leftover `*.sending` files are renamed
//! back, and their fingerprints are checked against the recent-sent log on
//! the next pickup to catch the crash-after-accept case.

pub mod flush;

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::prelude::*;
use log::warn;
use rand::{rngs::OsRng, Rng};
use serde::{Deserialize, Serialize};
use tiny_keccak::{Hasher, Kmac};
use tokio::sync::Notify;

use crate::support::error::Error;

/// Bound on the recent-sent fingerprint window.
pub const RECENT_SENT_WINDOW: usize = 1024;

const MSG_SUFFIX: &str = "msg";
const SENDING_SUFFIX: &str = "sending";
const FAILED_DIR: &str = "failed";
const RECENT_LOG: &str = "recent.log";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryHeader {
    /// Envelope sender.
    pub sender: String,
    /// Envelope recipients, in RCPT order.
    pub recipients: Vec<String>,
    pub enqueued: DateTime<Utc>,
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Entry {
    pub path: PathBuf,
    pub header: EntryHeader,
    pub mime: Vec<u8>,
}

pub struct Spool {
    dir: PathBuf,
    /// Pinged on enqueue so the flusher need not poll.
    enqueued: Notify,
}

impl Spool {
    pub fn new(dir: PathBuf) -> Result<Self, Error> {
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(dir.join(FAILED_DIR))?;
        Ok(Self {
            dir,
            enqueued: Notify::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Wait until something has been enqueued since the last call.
    pub async fn wait_enqueued(&self) {
        self.enqueued.notified().await;
    }

    /// Durably append a message to the queue.
    pub fn enqueue(
        &self,
        sender: String,
        recipients: Vec<String>,
        mime: &[u8],
    ) -> Result<PathBuf, Error> {
        let header = EntryHeader {
            sender,
            recipients,
            enqueued: Utc::now(),
            attempts: 0,
            last_error: None,
        };

        // Retry on the (cosmically unlikely) filename collision; the
        // random suffix changes every iteration.
        let path = loop {
            let name = format!(
                "{:020}-{:08x}.{MSG_SUFFIX}",
                header
                    .enqueued
                    .timestamp_nanos_opt()
                    .unwrap_or_else(|| header.enqueued.timestamp() * 1_000_000_000),
                OsRng.gen::<u32>(),
            );
            let path = self.dir.join(name);
            match write_entry(&self.dir, &path, &header, mime, false) {
                Ok(()) => break path,
                Err(Error::Io(ref e))
                    if std::io::ErrorKind::AlreadyExists == e.kind() => {},
                Err(e) => return Err(e),
            }
        };

        self.enqueued.notify_one();
        Ok(path)
    }

    /// Paths of all pending entries, in enqueue order.
    pub fn scan(&self) -> Result<Vec<PathBuf>, Error> {
        let mut entries = Vec::<PathBuf>::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str())
                == Some(MSG_SUFFIX)
            {
                entries.push(path);
            }
        }
        entries.sort();
        Ok(entries)
    }

    /// Reset any `*.sending` leftovers from a previous run to pending.
    pub fn recover(&self) -> Result<u32, Error> {
        let mut recovered = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str())
                == Some(SENDING_SUFFIX)
            {
                let restored = path.with_extension(MSG_SUFFIX);
                fs::rename(&path, &restored)?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            warn!(
                "Recovered {recovered} in-flight queue entr{} from a \
                 previous run",
                if 1 == recovered { "y" } else { "ies" },
            );
        }
        Ok(recovered)
    }

    /// Take exclusive hold of an entry for submission.
    pub fn mark_sending(&self, path: &Path) -> Result<PathBuf, Error> {
        let sending = path.with_extension(SENDING_SUFFIX);
        fs::rename(path, &sending)?;
        Ok(sending)
    }

    /// Release an in-flight entry back to pending with updated attempt
    /// bookkeeping.
    pub fn requeue(
        &self,
        sending: &Path,
        entry: &Entry,
    ) -> Result<(), Error> {
        let pending = sending.with_extension(MSG_SUFFIX);
        write_entry(&self.dir, &pending, &entry.header, &entry.mime, true)?;
        fs::remove_file(sending)?;
        Ok(())
    }

    /// Park an in-flight entry under `failed/` with its final error.
    pub fn fail(&self, sending: &Path, entry: &Entry) -> Result<(), Error> {
        let name = sending
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("entry");
        let failed = self
            .dir
            .join(FAILED_DIR)
            .join(format!("{name}.{MSG_SUFFIX}"));
        write_entry(&self.dir, &failed, &entry.header, &entry.mime, true)?;
        fs::remove_file(sending)?;
        Ok(())
    }

    /// Drop a delivered (or duplicate) in-flight entry.
    pub fn remove(&self, sending: &Path) -> Result<(), Error> {
        fs::remove_file(sending)?;
        Ok(())
    }
}

fn write_entry(
    tmp_dir: &Path,
    path: &Path,
    header: &EntryHeader,
    mime: &[u8],
    overwrite: bool,
) -> Result<(), Error> {
    let header_bytes = serde_cbor::to_vec(header)?;
    let mut data =
        Vec::with_capacity(2 + header_bytes.len() + mime.len());
    data.write_u16::<LittleEndian>(header_bytes.len() as u16)?;
    data.extend_from_slice(&header_bytes);
    data.extend_from_slice(mime);
    crate::support::file_ops::spit(tmp_dir, path, overwrite, 0o600, &data)?;
    Ok(())
}

pub fn read_entry(path: &Path) -> Result<Entry, Error> {
    let mut file = fs::File::open(path)?;
    let header_len = file.read_u16::<LittleEndian>()? as u64;
    let mut header_bytes = Vec::new();
    (&mut file)
        .take(header_len)
        .read_to_end(&mut header_bytes)?;
    if header_bytes.len() as u64 != header_len {
        return Err(Error::BadQueueEntry);
    }
    let header = serde_cbor::from_slice(&header_bytes)
        .map_err(|_| Error::BadQueueEntry)?;
    let mut mime = Vec::new();
    file.read_to_end(&mut mime)?;
    Ok(Entry {
        path: path.to_owned(),
        header,
        mime,
    })
}

/// Content-addressed fingerprint of a message: envelope sender, sorted
/// recipients, raw MIME.
pub fn fingerprint(
    sender: &str,
    recipients: &[String],
    mime: &[u8],
) -> String {
    let mut sorted: Vec<&str> =
        recipients.iter().map(String::as_str).collect();
    sorted.sort_unstable();

    let mut k = Kmac::v128(b"graphgate-queue", b"fingerprint");
    k.update(sender.as_bytes());
    k.update(&[0]);
    for recipient in sorted {
        k.update(recipient.as_bytes());
        k.update(&[0]);
    }
    k.update(mime);

    let mut out = [0u8; 16];
    k.finalize(&mut out);
    out.iter().map(|b| format!("{b:02x}")).collect()
}

/// The recent-sent fingerprint window, persisted one fingerprint per line
/// so it survives restarts.
pub struct RecentLog {
    path: PathBuf,
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl RecentLog {
    /// Load the log, trimming it to the window bound on the way in.
    pub fn load(queue_dir: &Path) -> Result<Self, Error> {
        let path = queue_dir.join(RECENT_LOG);
        let mut order = VecDeque::<String>::new();
        let mut set = HashSet::<String>::new();

        if let Ok(contents) = fs::read_to_string(&path) {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if set.insert(line.to_owned()) {
                    order.push_back(line.to_owned());
                }
            }
            while order.len() > RECENT_SENT_WINDOW {
                if let Some(old) = order.pop_front() {
                    set.remove(&old);
                }
            }
            // Rewrite the trimmed tail so the file does not grow without
            // bound across restarts.
            let mut rewritten = String::new();
            for fp in &order {
                rewritten.push_str(fp);
                rewritten.push('\n');
            }
            crate::support::file_ops::spit(
                queue_dir,
                &path,
                true,
                0o600,
                rewritten.as_bytes(),
            )?;
        }

        Ok(Self { path, order, set })
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.set.contains(fingerprint)
    }

    /// Record a delivered fingerprint, appending it to the on-disk log.
    pub fn record(&mut self, fingerprint: String) {
        if !self.set.insert(fingerprint.clone()) {
            return;
        }
        self.order.push_back(fingerprint.clone());
        while self.order.len() > RECENT_SENT_WINDOW {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }

        let appended = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{fingerprint}"));
        if let Err(e) = appended {
            warn!(
                "Unable to append to {}: {e}; duplicate protection is \
                 process-local until it can be written",
                self.path.display(),
            );
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    fn recipients(addrs: &[&str]) -> Vec<String> {
        addrs.iter().map(|&a| a.to_owned()).collect()
    }

    #[test]
    fn enqueue_scan_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path().to_owned()).unwrap();

        let first = spool
            .enqueue(
                "alerts@t.onmicrosoft.com".to_owned(),
                recipients(&["ops@example.com"]),
                b"Subject: one\r\n\r\nbody\r\n",
            )
            .unwrap();
        let second = spool
            .enqueue(
                "alerts@t.onmicrosoft.com".to_owned(),
                recipients(&["ops@example.com", "dev@example.com"]),
                b"Subject: two\r\n\r\nbody\r\n",
            )
            .unwrap();

        let scanned = spool.scan().unwrap();
        assert_eq!(vec![first.clone(), second.clone()], scanned);

        let entry = read_entry(&first).unwrap();
        assert_eq!("alerts@t.onmicrosoft.com", entry.header.sender);
        assert_eq!(recipients(&["ops@example.com"]), entry.header.recipients);
        assert_eq!(0, entry.header.attempts);
        assert_eq!(b"Subject: one\r\n\r\nbody\r\n".to_vec(), entry.mime);
    }

    #[test]
    fn sending_rename_and_recovery() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path().to_owned()).unwrap();
        let path = spool
            .enqueue(
                "a@b.com".to_owned(),
                recipients(&["c@d.com"]),
                b"x",
            )
            .unwrap();

        let sending = spool.mark_sending(&path).unwrap();
        assert!(spool.scan().unwrap().is_empty());
        assert!(sending.exists());

        // Simulate a crash: a fresh Spool over the same directory resets
        // the in-flight marker.
        let spool = Spool::new(dir.path().to_owned()).unwrap();
        assert_eq!(1, spool.recover().unwrap());
        assert_eq!(vec![path], spool.scan().unwrap());
    }

    #[test]
    fn requeue_updates_attempts() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path().to_owned()).unwrap();
        let path = spool
            .enqueue("a@b.com".to_owned(), recipients(&["c@d.com"]), b"x")
            .unwrap();

        let sending = spool.mark_sending(&path).unwrap();
        let mut entry = read_entry(&sending).unwrap();
        entry.header.attempts += 1;
        entry.header.last_error = Some("503".to_owned());
        spool.requeue(&sending, &entry).unwrap();

        let entry = read_entry(&path).unwrap();
        assert_eq!(1, entry.header.attempts);
        assert_eq!(Some("503".to_owned()), entry.header.last_error);
        assert!(!sending.exists());
    }

    #[test]
    fn failed_entries_move_aside() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::new(dir.path().to_owned()).unwrap();
        let path = spool
            .enqueue("a@b.com".to_owned(), recipients(&["c@d.com"]), b"x")
            .unwrap();

        let sending = spool.mark_sending(&path).unwrap();
        let mut entry = read_entry(&sending).unwrap();
        entry.header.last_error = Some("413".to_owned());
        spool.fail(&sending, &entry).unwrap();

        assert!(spool.scan().unwrap().is_empty());
        let failed: Vec<_> = fs::read_dir(dir.path().join(FAILED_DIR))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(1, failed.len());
        assert_eq!(
            Some("413".to_owned()),
            read_entry(&failed[0]).unwrap().header.last_error,
        );
    }

    #[test]
    fn fingerprint_ignores_recipient_order() {
        let a = fingerprint(
            "a@b.com",
            &recipients(&["x@y.com", "p@q.com"]),
            b"mime",
        );
        let b = fingerprint(
            "a@b.com",
            &recipients(&["p@q.com", "x@y.com"]),
            b"mime",
        );
        assert_eq!(a, b);

        assert_ne!(
            a,
            fingerprint("a@b.com", &recipients(&["p@q.com"]), b"mime"),
        );
        assert_ne!(
            a,
            fingerprint(
                "a@b.com",
                &recipients(&["x@y.com", "p@q.com"]),
                b"other",
            ),
        );
    }

    #[test]
    fn recent_log_persists_and_bounds() {
        let dir = TempDir::new().unwrap();
        let mut log = RecentLog::load(dir.path()).unwrap();
        assert!(!log.contains("aa"));
        log.record("aa".to_owned());
        log.record("bb".to_owned());
        assert!(log.contains("aa"));

        // Rehydration across a restart.
        let log = RecentLog::load(dir.path()).unwrap();
        assert!(log.contains("aa"));
        assert!(log.contains("bb"));
        assert_eq!(2, log.len());

        let mut log = RecentLog::load(dir.path()).unwrap();
        for i in 0..RECENT_SENT_WINDOW {
            log.record(format!("fp{i}"));
        }
        assert_eq!(RECENT_SENT_WINDOW, log.len());
        assert!(!log.contains("aa"));

        let log = RecentLog::load(dir.path()).unwrap();
        assert_eq!(RECENT_SENT_WINDOW, log.len());
        assert!(log.contains(&format!("fp{}", RECENT_SENT_WINDOW - 1)));
    }
}
