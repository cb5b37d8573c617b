//! In-process replica application.
//!
//! A [`SimulatedPillar`] listens on its replica's channels and answers every
//! payload the way a storage node would. Bit archives keep file contents,
//! checksum archives keep checksums only. A few knobs let tests make a pillar
//! silent, fail stores, hold batch jobs back or corrupt an entry.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arcgrid_bus::{
    BatchJobSpec, BatchReport, BusContext, Checksum, FileFailure, FileFilter, FileRef, JobId,
    Message, MessageListener, Payload, Reply, ReplicaKind,
};
use tracing::{debug, warn};

use crate::batch::FilterMatcher;
use crate::checksum::{digest, render_listing, ChecksumRecord};
use crate::client::Replica;
use crate::error::Result;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
struct Entry {
    content: Option<Vec<u8>>,
    checksum: Checksum,
}

struct PillarInner {
    replica: Replica,
    ctx: BusContext,
    files: Mutex<BTreeMap<String, Entry>>,
    terminated: Mutex<HashSet<JobId>>,
    held: Mutex<Vec<Message>>,
    silent: AtomicBool,
    fail_stores: AtomicBool,
    hold_batches: AtomicBool,
    received: AtomicUsize,
}

/// A reply, or the error text of a refusal.
type Outcome = std::result::Result<Reply, String>;

impl PillarInner {
    fn handle(&self, msg: Message) {
        self.received.fetch_add(1, Ordering::SeqCst);
        if self.silent.load(Ordering::SeqCst) {
            debug!(replica = %self.replica.id(), msg = %msg, "silent pillar dropped message");
            return;
        }
        if matches!(msg.payload(), Payload::RunBatch { .. })
            && self.hold_batches.load(Ordering::SeqCst)
        {
            lock(&self.held).push(msg);
            return;
        }
        self.respond(msg, false);
    }

    /// Answer a message. A late answer ignores termination of its batch job.
    fn respond(&self, mut msg: Message, late: bool) {
        let outcome = self.answer(msg.payload(), late);
        let recorded = match outcome {
            Ok(reply) => msg.set_reply(reply),
            Err(text) => match self.partial(msg.payload()) {
                Some(reply) => msg.set_failed(reply, text),
                None => msg.set_not_ok(text),
            },
        };
        if let Err(e) = recorded {
            warn!(msg = %msg, error = %e, "reply already recorded");
            return;
        }
        if let Err(e) = self.ctx.bus.reply(&msg) {
            warn!(replica = %self.replica.id(), msg = %msg, error = %e, "reply not delivered");
        }
    }

    fn answer(&self, payload: &Payload, late: bool) -> Outcome {
        match payload {
            Payload::Store {
                file,
                precomputed_checksum,
            } => self.store(file, precomputed_checksum.as_ref()),
            Payload::Retrieve { file_id, offset } => self.retrieve(file_id, *offset),
            Payload::RunBatch {
                job_id,
                spec,
                filter,
                ..
            } => self.run_batch(job_id, spec, filter, late),
            Payload::TerminateBatch { job_id } => {
                if lock(&self.terminated).insert(job_id.clone()) {
                    debug!(replica = %self.replica.id(), job = %job_id, "batch job terminated");
                }
                Ok(Reply::Terminated {
                    job_id: job_id.clone(),
                    replica: self.replica.id().clone(),
                })
            }
            Payload::Correct {
                filename,
                expected_checksum,
                reported_checksum,
                replacement,
            } => self.correct(
                filename,
                expected_checksum,
                reported_checksum,
                replacement.as_ref(),
            ),
            Payload::GetChecksum { filename } => lock(&self.files)
                .get(filename)
                .map(|e| Reply::Checksum {
                    filename: filename.clone(),
                    checksum: e.checksum.clone(),
                })
                .ok_or_else(|| format!("{} not found", filename)),
            Payload::GetAllChecksums => self.listing(true),
            Payload::GetAllFilenames => self.listing(false),
        }
    }

    /// Partial result carried by a failed batch reply.
    fn partial(&self, payload: &Payload) -> Option<Reply> {
        match payload {
            Payload::RunBatch { job_id, .. } => Some(Reply::Batch(BatchReport {
                job_id: job_id.clone(),
                replica: self.replica.id().clone(),
                files_processed: 0,
                failures: Vec::new(),
                output: Vec::new(),
            })),
            _ => None,
        }
    }

    fn store(&self, file: &FileRef, precomputed: Option<&Checksum>) -> Outcome {
        if self.fail_stores.load(Ordering::SeqCst) {
            return Err(format!("store of {} failed", file.name));
        }
        let checksum = digest(&file.content);
        if let Some(pre) = precomputed {
            if *pre != checksum {
                return Err(format!(
                    "checksum mismatch for {}: expected {}, got {}",
                    file.name, pre, checksum
                ));
            }
        }
        let mut files = lock(&self.files);
        if let Some(existing) = files.get(&file.name) {
            if existing.checksum != checksum {
                return Err(format!("{} already stored with another checksum", file.name));
            }
        } else {
            files.insert(file.name.clone(), self.entry(&file.content));
        }
        Ok(Reply::Stored {
            filename: file.name.clone(),
            checksum,
        })
    }

    fn retrieve(&self, file_id: &str, offset: u64) -> Outcome {
        if self.replica.kind() != ReplicaKind::BitArchive {
            return Err("retrieve is not supported by a checksum archive".to_string());
        }
        let files = lock(&self.files);
        let entry = files
            .get(file_id)
            .ok_or_else(|| format!("{} not found", file_id))?;
        let content = entry.content.as_deref().unwrap_or_default();
        let start = usize::try_from(offset)
            .ok()
            .filter(|o| *o <= content.len())
            .ok_or_else(|| format!("offset {} beyond end of {}", offset, file_id))?;
        Ok(Reply::Record {
            file_id: file_id.to_string(),
            offset,
            data: content[start..].to_vec(),
        })
    }

    fn run_batch(
        &self,
        job_id: &JobId,
        spec: &BatchJobSpec,
        filter: &FileFilter,
        late: bool,
    ) -> Outcome {
        if self.replica.kind() != ReplicaKind::BitArchive {
            return Err("batch jobs are not supported by a checksum archive".to_string());
        }
        if !late && lock(&self.terminated).contains(job_id) {
            return Err(format!("batch job {} was terminated", job_id));
        }
        let matcher = FilterMatcher::new(filter).map_err(|e| e.to_string())?;
        let files = lock(&self.files);
        let mut output = String::new();
        let mut failures = Vec::new();
        let mut processed = 0;
        for (name, entry) in files.iter().filter(|(name, _)| matcher.matches(name)) {
            match spec {
                BatchJobSpec::Checksum => {
                    output.push_str(&ChecksumRecord::new(name.clone(), entry.checksum.clone()).to_line());
                    output.push('\n');
                }
                BatchJobSpec::ListFiles => {
                    output.push_str(name);
                    output.push('\n');
                }
                BatchJobSpec::Custom { name: job, .. } => {
                    failures.push(FileFailure {
                        filename: name.clone(),
                        error: format!("unknown job {}", job),
                    });
                    continue;
                }
            }
            processed += 1;
        }
        Ok(Reply::Batch(BatchReport {
            job_id: job_id.clone(),
            replica: self.replica.id().clone(),
            files_processed: processed,
            failures,
            output: output.into_bytes(),
        }))
    }

    fn correct(
        &self,
        filename: &str,
        expected: &Checksum,
        reported: &Checksum,
        replacement: Option<&FileRef>,
    ) -> Outcome {
        let mut files = lock(&self.files);
        let entry = files
            .get_mut(filename)
            .ok_or_else(|| format!("{} not found", filename))?;
        if entry.checksum != *reported {
            return Err(format!(
                "current checksum {} of {} no longer matches reported {}",
                entry.checksum, filename, reported
            ));
        }
        match self.replica.kind() {
            ReplicaKind::BitArchive => {
                let file = replacement.ok_or_else(|| "no replacement file".to_string())?;
                let actual = digest(&file.content);
                if actual != *expected {
                    return Err(format!("replacement has checksum {}, not {}", actual, expected));
                }
                entry.content = Some(file.content.clone());
                entry.checksum = actual;
            }
            ReplicaKind::ChecksumArchive => entry.checksum = expected.clone(),
        }
        Ok(Reply::Corrected {
            filename: filename.to_string(),
            checksum: entry.checksum.clone(),
        })
    }

    fn listing(&self, with_checksums: bool) -> Outcome {
        if self.replica.kind() != ReplicaKind::ChecksumArchive {
            return Err("listings are not supported by a bit archive".to_string());
        }
        let files = lock(&self.files);
        let mut lines = String::new();
        for (name, entry) in files.iter() {
            if with_checksums {
                lines.push_str(&ChecksumRecord::new(name.clone(), entry.checksum.clone()).to_line());
            } else {
                lines.push_str(name);
            }
            lines.push('\n');
        }
        let replica = self.replica.id().clone();
        Ok(if with_checksums {
            Reply::ChecksumListing { replica, lines }
        } else {
            Reply::FilenameListing { replica, lines }
        })
    }

    fn entry(&self, content: &[u8]) -> Entry {
        Entry {
            content: (self.replica.kind() == ReplicaKind::BitArchive).then(|| content.to_vec()),
            checksum: digest(content),
        }
    }
}

struct PillarListener {
    inner: Arc<PillarInner>,
}

impl MessageListener for PillarListener {
    fn on_message(&self, msg: Message) {
        self.inner.handle(msg);
    }
}

/// A simulated replica application instance.
pub struct SimulatedPillar {
    inner: Arc<PillarInner>,
    listener: Arc<dyn MessageListener>,
}

impl SimulatedPillar {
    /// Start answering on the replica's broadcast, queue and monitor channels.
    pub fn start(replica: Replica, ctx: BusContext) -> Result<Self> {
        let inner = Arc::new(PillarInner {
            replica,
            ctx,
            files: Mutex::new(BTreeMap::new()),
            terminated: Mutex::new(HashSet::new()),
            held: Mutex::new(Vec::new()),
            silent: AtomicBool::new(false),
            fail_stores: AtomicBool::new(false),
            hold_batches: AtomicBool::new(false),
            received: AtomicUsize::new(0),
        });
        let listener: Arc<dyn MessageListener> = Arc::new(PillarListener {
            inner: Arc::clone(&inner),
        });
        for channel in [inner.replica.all(), inner.replica.any(), inner.replica.monitor()] {
            inner.ctx.bus.set_listener(channel, Arc::clone(&listener))?;
        }
        debug!(replica = %inner.replica.id(), kind = %inner.replica.kind(), "pillar started");
        Ok(Self { inner, listener })
    }

    /// Stop listening.
    pub fn stop(&self) -> Result<()> {
        for channel in [
            self.inner.replica.all(),
            self.inner.replica.any(),
            self.inner.replica.monitor(),
        ] {
            self.inner.ctx.bus.remove_listener(channel, &self.listener)?;
        }
        Ok(())
    }

    /// The replica served.
    pub fn replica(&self) -> &Replica {
        &self.inner.replica
    }

    /// Preload a file without going through the bus.
    pub fn insert(&self, filename: &str, content: &[u8]) -> Checksum {
        let entry = self.inner.entry(content);
        let checksum = entry.checksum.clone();
        lock(&self.inner.files).insert(filename.to_string(), entry);
        checksum
    }

    /// Current checksum of a file.
    pub fn checksum(&self, filename: &str) -> Option<Checksum> {
        lock(&self.inner.files)
            .get(filename)
            .map(|e| e.checksum.clone())
    }

    /// Current content of a file (bit archives only).
    pub fn content(&self, filename: &str) -> Option<Vec<u8>> {
        lock(&self.inner.files)
            .get(filename)
            .and_then(|e| e.content.clone())
    }

    /// Damage a stored entry. Returns its new checksum.
    pub fn corrupt(&self, filename: &str) -> Option<Checksum> {
        let mut files = lock(&self.inner.files);
        let entry = files.get_mut(filename)?;
        match &mut entry.content {
            Some(content) => {
                content.push(0xff);
                entry.checksum = digest(content);
            }
            None => entry.checksum = digest(entry.checksum.as_str().as_bytes()),
        }
        Some(entry.checksum.clone())
    }

    /// Drop every message without replying.
    pub fn set_silent(&self, silent: bool) {
        self.inner.silent.store(silent, Ordering::SeqCst);
    }

    /// Refuse every store.
    pub fn set_fail_stores(&self, fail: bool) {
        self.inner.fail_stores.store(fail, Ordering::SeqCst);
    }

    /// Keep batch jobs unanswered until [`release_batches`](Self::release_batches).
    pub fn set_hold_batches(&self, hold: bool) {
        self.inner.hold_batches.store(hold, Ordering::SeqCst);
    }

    /// Answer every held batch job now. Returns how many were released.
    pub fn release_batches(&self) -> usize {
        self.inner.hold_batches.store(false, Ordering::SeqCst);
        let held: Vec<Message> = lock(&self.inner.held).drain(..).collect();
        let n = held.len();
        for msg in held {
            self.inner.respond(msg, true);
        }
        n
    }

    /// Messages received so far, answered or not.
    pub fn received(&self) -> usize {
        self.inner.received.load(Ordering::SeqCst)
    }

    /// The stored filenames, sorted.
    pub fn filenames(&self) -> Vec<String> {
        lock(&self.inner.files).keys().cloned().collect()
    }

    /// The stored entries as sorted checksum records.
    pub fn records(&self) -> Vec<ChecksumRecord> {
        lock(&self.inner.files)
            .iter()
            .map(|(name, e)| ChecksumRecord::new(name.clone(), e.checksum.clone()))
            .collect()
    }

    /// The stored entries in listing form.
    pub fn dump(&self) -> String {
        render_listing(&self.records())
    }
}
