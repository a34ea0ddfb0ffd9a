//! Import coordinator.
//!
//! One reader thread cuts the dump into raw batches, a pool of workers
//! decodes them, and the calling thread commits decoded batches in dump
//! order, saving the checkpoint after every commit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use serde::Serialize;

use crate::checkpoint::{CheckpointStore, ImportCheckpoint};
use crate::decoder::{DecodeContext, decode_record};
use crate::domain::{Clock, Entity, EntityId, Source};
use crate::error::MirrorError;
use crate::reader::{Compression, DEFAULT_MAX_RECORD_BYTES, DumpReader, RawRecord, ResumePoint, dump_len};
use crate::store::{BatchWriter, CommitToken};

const MAX_REPORTED_FAILURES: usize = 100;

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub batch_size: usize,
    pub workers: usize,
    pub max_decode_error_rate: f64,
    pub min_decode_errors_for_abort: usize,
    pub storage_retries: usize,
    pub retry_base_delay: Duration,
    pub report_interval: Duration,
    pub max_record_bytes: usize,
    /// Stop after this many batches; the next run resumes after them.
    pub max_batches: Option<u64>,
    /// Drop any existing checkpoint and start from the top of the dump.
    pub restart: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            workers: default_workers(),
            max_decode_error_rate: 0.05,
            min_decode_errors_for_abort: 10,
            storage_retries: 5,
            retry_base_delay: Duration::from_millis(500),
            report_interval: Duration::from_secs(30),
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            max_batches: None,
            restart: false,
        }
    }
}

pub fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, 8)
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Shared flag checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodeFailure {
    pub offset: u64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub dump: String,
    pub compression: Option<Compression>,
    pub started_at_offset: u64,
    pub byte_offset: u64,
    /// Entities written by this run.
    pub entities_committed: u64,
    /// Entities written by every run against this checkpoint.
    pub total_committed: u64,
    pub batches_committed: u64,
    pub stale_skipped: u64,
    pub decode_failures: usize,
    /// First failures of the run, capped.
    pub failures: Vec<DecodeFailure>,
    pub last_id: Option<EntityId>,
    pub completed: bool,
    pub already_completed: bool,
    pub cancelled: bool,
    pub elapsed_secs: f64,
}

pub struct ImportCoordinator {
    store: Arc<dyn BatchWriter>,
    checkpoints: CheckpointStore,
    clock: Arc<dyn Clock>,
    options: ImportOptions,
    cancel: CancelToken,
}

struct RawBatch {
    seq: u64,
    records: Vec<RawRecord>,
    /// Reader error hit after `records`.
    error: Option<MirrorError>,
    end_of_dump: bool,
}

struct DecodedBatch {
    seq: u64,
    entities: Vec<Entity>,
    failures: Vec<DecodeFailure>,
    records: usize,
    resume: Option<ResumePoint>,
    error: Option<MirrorError>,
    end_of_dump: bool,
}

enum Finish {
    EndOfDump,
    Cancelled,
    BatchLimit,
}

struct RunState {
    checkpoint: ImportCheckpoint,
    committed: u64,
    batches: u64,
    stale: u64,
    failure_count: usize,
    failures: Vec<DecodeFailure>,
    started: Instant,
    last_report: Instant,
}

impl ImportCoordinator {
    pub fn new(
        store: Arc<dyn BatchWriter>,
        checkpoints: CheckpointStore,
        clock: Arc<dyn Clock>,
        options: ImportOptions,
    ) -> Self {
        Self {
            store,
            checkpoints,
            clock,
            options,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn options(&self) -> &ImportOptions {
        &self.options
    }

    pub fn run(&mut self, dump: &Utf8Path, sink: &dyn ProgressSink) -> Result<ImportReport, MirrorError> {
        let started = Instant::now();
        let dump_len = dump_len(dump)?;

        if self.options.restart {
            tracing::info!(checkpoint = %self.checkpoints.path(), "clearing import checkpoint");
            self.checkpoints.clear()?;
        }
        let checkpoint = match self.checkpoints.load()? {
            Some(checkpoint) => {
                if let Some(recorded) = checkpoint.dump_len {
                    if recorded != dump_len {
                        return Err(MirrorError::CheckpointMismatch(format!(
                            "checkpoint {} was recorded for a {recorded}-byte dump, {dump} has {dump_len} bytes",
                            self.checkpoints.path()
                        )));
                    }
                }
                checkpoint
            }
            None => ImportCheckpoint {
                byte_offset: 0,
                entities_committed: 0,
                frame: Default::default(),
                last_id: None,
                dump_len: Some(dump_len),
                completed: false,
                updated_at: self.clock.now(),
            },
        };

        if checkpoint.completed {
            tracing::info!(%dump, entities = checkpoint.entities_committed, "import already completed");
            sink.event(ProgressEvent {
                message: format!("phase=Import; already complete ({} entities)", checkpoint.entities_committed),
                elapsed: Some(started.elapsed()),
            });
            return Ok(ImportReport {
                dump: dump.to_string(),
                compression: None,
                started_at_offset: checkpoint.byte_offset,
                byte_offset: checkpoint.byte_offset,
                entities_committed: 0,
                total_committed: checkpoint.entities_committed,
                batches_committed: 0,
                stale_skipped: 0,
                decode_failures: 0,
                failures: Vec::new(),
                last_id: checkpoint.last_id,
                completed: true,
                already_completed: true,
                cancelled: false,
                elapsed_secs: started.elapsed().as_secs_f64(),
            });
        }

        let resume = checkpoint.resume_point();
        let reader = DumpReader::open(dump, resume)?.with_max_record_bytes(self.options.max_record_bytes);
        let compression = reader.compression();
        tracing::info!(
            %dump,
            ?compression,
            offset = resume.byte_offset,
            committed = checkpoint.entities_committed,
            "starting import"
        );
        sink.event(ProgressEvent {
            message: format!("phase=Import; starting at offset {}", resume.byte_offset),
            elapsed: None,
        });

        let mut state = RunState {
            checkpoint: ImportCheckpoint {
                dump_len: Some(dump_len),
                ..checkpoint
            },
            committed: 0,
            batches: 0,
            stale: 0,
            failure_count: 0,
            failures: Vec::new(),
            started,
            last_report: started,
        };
        let finish = self.pipeline(reader, &mut state, sink)?;

        let elapsed = started.elapsed();
        let completed = matches!(finish, Finish::EndOfDump);
        let cancelled = matches!(finish, Finish::Cancelled);
        tracing::info!(
            committed = state.committed,
            total = state.checkpoint.entities_committed,
            offset = state.checkpoint.byte_offset,
            failures = state.failure_count,
            completed,
            cancelled,
            elapsed_secs = elapsed.as_secs_f64(),
            "import run finished"
        );
        sink.event(ProgressEvent {
            message: format!(
                "phase=Import; finished: committed={} failures={} completed={completed}",
                state.committed, state.failure_count
            ),
            elapsed: Some(elapsed),
        });

        Ok(ImportReport {
            dump: dump.to_string(),
            compression: Some(compression),
            started_at_offset: resume.byte_offset,
            byte_offset: state.checkpoint.byte_offset,
            entities_committed: state.committed,
            total_committed: state.checkpoint.entities_committed,
            batches_committed: state.batches,
            stale_skipped: state.stale,
            decode_failures: state.failure_count,
            failures: state.failures,
            last_id: state.checkpoint.last_id,
            completed,
            already_completed: false,
            cancelled,
            elapsed_secs: elapsed.as_secs_f64(),
        })
    }

    fn pipeline(
        &mut self,
        reader: DumpReader,
        state: &mut RunState,
        sink: &dyn ProgressSink,
    ) -> Result<Finish, MirrorError> {
        let workers = self.options.workers.max(1);
        let batch_size = self.options.batch_size.max(1);
        let max_batches = self.options.max_batches;
        let ctx = DecodeContext::new(Source::Dump, self.clock.now());
        let stop = AtomicBool::new(false);
        let cancel = self.cancel.clone();

        let (raw_tx, raw_rx) = sync_channel::<RawBatch>(workers * 2);
        let raw_rx = Arc::new(Mutex::new(raw_rx));
        let (decoded_tx, decoded_rx) = sync_channel::<DecodedBatch>(workers * 2);

        thread::scope(|scope| {
            let stop = &stop;
            let cancel_for_reader = cancel.clone();
            scope.spawn(move || {
                read_batches(reader, raw_tx, batch_size, max_batches, stop, &cancel_for_reader)
            });
            for _ in 0..workers {
                let raw_rx = Arc::clone(&raw_rx);
                let decoded_tx = decoded_tx.clone();
                scope.spawn(move || decode_batches(&raw_rx, decoded_tx, ctx));
            }
            drop(decoded_tx);
            drop(raw_rx);

            let outcome = self.write_batches(decoded_rx, state, sink, &cancel, max_batches.is_some());
            stop.store(true, Ordering::SeqCst);
            outcome
        })
    }

    fn write_batches(
        &mut self,
        decoded: Receiver<DecodedBatch>,
        state: &mut RunState,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
        bounded: bool,
    ) -> Result<Finish, MirrorError> {
        let mut pending = BTreeMap::new();
        let mut next_seq = 0u64;

        for batch in decoded {
            pending.insert(batch.seq, batch);
            while let Some(batch) = pending.remove(&next_seq) {
                next_seq += 1;
                let end_of_dump = batch.end_of_dump;
                self.commit_batch(batch, state)?;

                if state.last_report.elapsed() >= self.options.report_interval {
                    state.last_report = Instant::now();
                    report_progress(state, sink);
                }
                if end_of_dump {
                    self.mark_completed(state)?;
                    return Ok(Finish::EndOfDump);
                }
                if cancel.is_cancelled() {
                    tracing::info!(offset = state.checkpoint.byte_offset, "import cancelled");
                    return Ok(Finish::Cancelled);
                }
            }
        }

        if cancel.is_cancelled() {
            return Ok(Finish::Cancelled);
        }
        if bounded {
            return Ok(Finish::BatchLimit);
        }
        Err(MirrorError::Filesystem(
            "dump reader stopped before the end of the dump".to_string(),
        ))
    }

    fn commit_batch(&mut self, batch: DecodedBatch, state: &mut RunState) -> Result<(), MirrorError> {
        let failed = batch.failures.len();
        if failed > 0 && batch.records > 0 {
            let rate = failed as f64 / batch.records as f64;
            if rate > self.options.max_decode_error_rate && failed >= self.options.min_decode_errors_for_abort {
                let offset = batch.failures.first().map(|f| f.offset).unwrap_or_default();
                tracing::error!(offset, failed, records = batch.records, "decode failure rate too high");
                return Err(MirrorError::ImportAborted {
                    offset,
                    failed,
                    records: batch.records,
                });
            }
        }
        state.failure_count += failed;
        let room = MAX_REPORTED_FAILURES.saturating_sub(state.failures.len());
        state.failures.extend(batch.failures.into_iter().take(room));

        if !batch.entities.is_empty() {
            let token = self.commit_with_retry(&batch.entities)?;
            state.stale += token.stale as u64;
        }

        if let Some(resume) = batch.resume {
            let written = batch.entities.len() as u64;
            let mut next = state.checkpoint.clone();
            next.byte_offset = resume.byte_offset;
            next.frame = resume.frame;
            next.entities_committed += written;
            if let Some(last) = batch.entities.last() {
                next.last_id = Some(last.id.clone());
            }
            next.updated_at = self.clock.now();
            self.checkpoints.save(&next)?;
            state.checkpoint = next;
            state.committed += written;
            state.batches += 1;
        }

        match batch.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn commit_with_retry(&self, entities: &[Entity]) -> Result<CommitToken, MirrorError> {
        let mut attempt = 0usize;
        loop {
            match self.store.upsert_batch(entities) {
                Ok(token) => return Ok(token),
                Err(err) if err.is_retryable_storage() && attempt < self.options.storage_retries => {
                    attempt += 1;
                    let delay = self.options.retry_base_delay * attempt as u32;
                    tracing::warn!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "retrying batch commit");
                    thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn mark_completed(&mut self, state: &mut RunState) -> Result<(), MirrorError> {
        let mut done = state.checkpoint.clone();
        done.completed = true;
        done.updated_at = self.clock.now();
        self.checkpoints.save(&done)?;
        state.checkpoint = done;
        Ok(())
    }
}

fn report_progress(state: &RunState, sink: &dyn ProgressSink) {
    let elapsed = state.started.elapsed();
    let rate = state.committed as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    tracing::info!(
        committed = state.committed,
        total = state.checkpoint.entities_committed,
        offset = state.checkpoint.byte_offset,
        failures = state.failure_count,
        rate = format!("{rate:.0}/s"),
        "import progress"
    );
    sink.event(ProgressEvent {
        message: format!(
            "phase=Import; committed={} offset={} failures={} rate={rate:.0}/s",
            state.checkpoint.entities_committed, state.checkpoint.byte_offset, state.failure_count
        ),
        elapsed: Some(elapsed),
    });
}

fn read_batches(
    mut reader: DumpReader,
    raw_tx: SyncSender<RawBatch>,
    batch_size: usize,
    max_batches: Option<u64>,
    stop: &AtomicBool,
    cancel: &CancelToken,
) {
    let mut seq = 0u64;
    loop {
        if stop.load(Ordering::SeqCst) || cancel.is_cancelled() {
            return;
        }
        if max_batches.is_some_and(|max| seq >= max) {
            return;
        }

        let mut batch = RawBatch {
            seq,
            records: Vec::with_capacity(batch_size),
            error: None,
            end_of_dump: false,
        };
        while batch.records.len() < batch_size {
            match reader.next() {
                Some(Ok(record)) => batch.records.push(record),
                Some(Err(err)) => {
                    batch.error = Some(err);
                    break;
                }
                None => {
                    batch.end_of_dump = true;
                    break;
                }
            }
        }

        let last = batch.error.is_some() || batch.end_of_dump;
        if raw_tx.send(batch).is_err() || last {
            return;
        }
        seq += 1;
    }
}

fn decode_batches(raw_rx: &Mutex<Receiver<RawBatch>>, decoded_tx: SyncSender<DecodedBatch>, ctx: DecodeContext) {
    loop {
        let batch = {
            let Ok(rx) = raw_rx.lock() else {
                return;
            };
            match rx.recv() {
                Ok(batch) => batch,
                Err(_) => return,
            }
        };

        let mut entities = Vec::with_capacity(batch.records.len());
        let mut failures = Vec::new();
        for record in &batch.records {
            match decode_record(&record.bytes, &ctx) {
                Ok(entity) => entities.push(entity),
                Err(err) => {
                    tracing::warn!(offset = record.offset, error = %err, "skipping undecodable record");
                    failures.push(DecodeFailure {
                        offset: record.offset,
                        message: err.to_string(),
                    });
                }
            }
        }

        let decoded = DecodedBatch {
            seq: batch.seq,
            entities,
            failures,
            records: batch.records.len(),
            resume: batch.records.last().map(RawRecord::next_resume_point),
            error: batch.error,
            end_of_dump: batch.end_of_dump,
        };
        if decoded_tx.send(decoded).is_err() {
            return;
        }
    }
}
