//! The broker's single-file write-ahead journal.
//!
//! Every durable mutation is appended as one length-prefixed,
//! checksummed record before the in-memory index changes. Framing
//! mirrors the signature-then-length-then-payload shape of this crate's
//! original WAL segment format, collapsed onto a single growing file
//! with a CRC32 instead of a bare signature check, since recovery here
//! must tell "valid record" from "torn write" rather than just "start of
//! record".

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message::{DeadLetter, LastError, Message, MessageId};

const MAGIC: [u8; 8] = *b"BRKRJRNL";

/// Short pause before the one internal retry of a failed storage call,
/// per the broker's "retried once with a short backoff before
/// surfacing" error-handling policy.
const STORAGE_RETRY_DELAY: Duration = Duration::from_millis(20);

/// One durable state transition. Variants mirror the operations in
/// §4.1-§4.4 exactly so replay is a straight match over them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JournalRecord {
    Enqueued(Message),
    DequeuedInflight {
        id: MessageId,
        last_attempt_at: i64,
    },
    Acked {
        id: MessageId,
    },
    Nacked {
        id: MessageId,
        attempts: u32,
        next_retry_at: i64,
        error_last: LastError,
    },
    DlqMoved {
        dead_letter: DeadLetter,
    },
    /// Administrative requeue of a message still present in the main
    /// registry (e.g. an Acked record not yet purged).
    Requeued {
        id: MessageId,
        next_retry_at: i64,
    },
    /// `DeadLetterStore::retry` — pulls a record out of the DLQ and
    /// reinserts it as pending, in one transaction.
    DlqRetried {
        id: MessageId,
        next_retry_at: i64,
    },
    Expired {
        id: MessageId,
    },
    DlqReviewed {
        id: MessageId,
        reviewed_by: String,
        reviewed_at: i64,
    },
    DlqPurged {
        id: MessageId,
    },
    /// `queue_meta` upsert — also how circuit-breaker snapshots are
    /// persisted, keyed `circuit_breaker:<platform>`, per §4.4/§6.
    MetaSet {
        key: String,
        value: String,
        updated_at: i64,
    },
    /// An inflight message reverted to pending without incrementing
    /// `attempts` — shutdown-timeout abandonment or startup recovery,
    /// never a delivery failure.
    InflightReverted {
        id: MessageId,
        next_retry_at: i64,
    },
}

/// Append-only durable log backing the broker's store.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        Ok(Self { path, file })
    }

    /// Appends one record. Syncs to disk when `durable` is set, otherwise
    /// just flushes — matching the `durable` flag on the inherited WAL's
    /// `append_entry`.
    ///
    /// A failed write is retried once, after a short backoff, before the
    /// error surfaces to the caller. The file is truncated back to its
    /// pre-attempt length before the retry, so a partial `write_all` from
    /// the first attempt can't leave a torn record ahead of the retried
    /// one — replay would otherwise stop at that torn record and never
    /// see the good one behind it.
    pub fn append(&mut self, record: &JournalRecord, durable: bool) -> io::Result<()> {
        let payload = bincode::serialize(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let checksum = crc32fast::hash(&payload);

        let write_once = |file: &mut File| -> io::Result<()> {
            file.write_all(&MAGIC)?;
            file.write_all(&(payload.len() as u32).to_le_bytes())?;
            file.write_all(&checksum.to_le_bytes())?;
            file.write_all(&payload)?;
            if durable {
                file.sync_data()
            } else {
                file.flush()
            }
        };

        let pre_len = self.file.metadata()?.len();
        match write_once(&mut self.file) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.file.set_len(pre_len)?;
                thread::sleep(STORAGE_RETRY_DELAY);
                write_once(&mut self.file)
            }
        }
    }

    /// Retried once, after a short backoff, before surfacing.
    pub fn sync(&mut self) -> io::Result<()> {
        match self.file.sync_data() {
            Ok(()) => Ok(()),
            Err(_) => {
                thread::sleep(STORAGE_RETRY_DELAY);
                self.file.sync_data()
            }
        }
    }

    /// Replays every well-formed record from the start of the file.
    ///
    /// A torn write at the tail — a crash mid-`write_all` — is an
    /// expected failure mode, not corruption: replay stops at the first
    /// incomplete or checksum-mismatched record and truncates the file
    /// there, discarding only that partial tail.
    pub fn replay(&mut self) -> io::Result<Vec<JournalRecord>> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut good_up_to: u64 = 0;
        let mut position: u64 = 0;

        loop {
            let mut magic_buf = [0u8; 8];
            match reader.read_exact(&mut magic_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            if magic_buf != MAGIC {
                break;
            }

            let mut len_buf = [0u8; 4];
            if reader.read_exact(&mut len_buf).is_err() {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut checksum_buf = [0u8; 4];
            if reader.read_exact(&mut checksum_buf).is_err() {
                break;
            }
            let expected_checksum = u32::from_le_bytes(checksum_buf);

            let mut payload = vec![0u8; len];
            if reader.read_exact(&mut payload).is_err() {
                break;
            }

            if crc32fast::hash(&payload) != expected_checksum {
                break;
            }

            match bincode::deserialize::<JournalRecord>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }

            position += 8 + 4 + 4 + len as u64;
            good_up_to = position;
        }

        // Drop any torn tail so future appends start from clean ground.
        self.file.set_len(good_up_to)?;
        self.file.flush()?;
        let new_pos = self.file.metadata()?.len();
        debug_assert_eq!(new_pos, good_up_to);

        Ok(records)
    }

    /// Rewrites the journal from a fresh snapshot of records, dropping
    /// history superseded by the current in-memory index (an acked
    /// message's enqueue/dequeue/ack trail collapses to nothing once the
    /// message is gone). The swap is atomic via rename.
    ///
    /// Retried once, after a short backoff, before surfacing — the tmp
    /// file is truncated on every attempt, so redoing the whole sequence
    /// is safe.
    pub fn compact(&mut self, records: &[JournalRecord]) -> io::Result<()> {
        match self.compact_once(records) {
            Ok(()) => Ok(()),
            Err(_) => {
                thread::sleep(STORAGE_RETRY_DELAY);
                self.compact_once(records)
            }
        }
    }

    fn compact_once(&mut self, records: &[JournalRecord]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("compact.tmp");
        {
            let mut tmp_file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            for record in records {
                let payload = bincode::serialize(record)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                let checksum = crc32fast::hash(&payload);
                tmp_file.write_all(&MAGIC)?;
                tmp_file.write_all(&(payload.len() as u32).to_le_bytes())?;
                tmp_file.write_all(&checksum.to_le_bytes())?;
                tmp_file.write_all(&payload)?;
            }
            tmp_file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
