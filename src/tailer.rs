// SPDX-License-Identifier: Apache-2.0

//! Per-identity resumable reader.
//!
//! A tailer owns no file state between reads beyond its byte offset: every
//! [`Tailer::read_once`] re-opens the path recorded in the registry,
//! re-verifies the file's identity, seeks, and consumes whatever complete
//! separator-terminated chunks are available. Partial trailing data is left
//! unconsumed (and the offset unmoved) so it is re-read once the producer
//! finishes the record.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::multiline::MultilineAggregator;
use crate::registry::FileRegistry;
use crate::shutdown::{shutdown_channel, Shutdown, ShutdownSignal};

/// How long `run` dozes at EOF before probing the file again.
const EOF_SLEEP: Duration = Duration::from_millis(500);

const INITIAL_BUFFER_CAPACITY: usize = 4096;

/// Pool of read buffers shared by all tailers of one collector, so
/// reopening files does not reallocate.
#[derive(Clone, Default)]
pub(crate) struct BufferPool {
    bufs: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl BufferPool {
    fn acquire(&self) -> Vec<u8> {
        self.bufs
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(INITIAL_BUFFER_CAPACITY))
    }

    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        self.bufs.lock().unwrap().push(buf);
    }
}

/// Stops a standalone tailer's [`Tailer::run`] loop.
pub struct TailerHandle {
    signal: ShutdownSignal,
}

impl TailerHandle {
    pub fn stop(self) {
        self.signal.shutdown();
    }
}

pub struct Tailer {
    id: String,
    offset: u64,
    separator: Vec<u8>,
    multiline: Option<MultilineAggregator>,
    registry: Arc<FileRegistry>,
    shutdown: Shutdown,
    pool: BufferPool,
    file: Option<BufReader<File>>,
    buf: Option<Vec<u8>>,
}

impl Tailer {
    /// Standalone constructor for "tail -f" style use. Returns the tailer
    /// and a handle whose `stop` ends a running [`Tailer::run`] loop.
    pub fn new(
        id: impl Into<String>,
        separator: impl Into<String>,
        offset: u64,
        registry: Arc<FileRegistry>,
        multiline: Option<MultilineAggregator>,
    ) -> (Self, TailerHandle) {
        let (signal, shutdown) = shutdown_channel();
        let tailer = Self::with_runtime(
            id,
            separator,
            offset,
            registry,
            multiline,
            BufferPool::default(),
            shutdown,
        );
        (tailer, TailerHandle { signal })
    }

    pub(crate) fn with_runtime(
        id: impl Into<String>,
        separator: impl Into<String>,
        offset: u64,
        registry: Arc<FileRegistry>,
        multiline: Option<MultilineAggregator>,
        pool: BufferPool,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            id: id.into(),
            offset,
            separator: separator.into().into_bytes(),
            multiline,
            registry,
            shutdown,
            pool,
            file: None,
            buf: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bytes consumed from the start of the file across all reads.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read all complete chunks currently available, then return at EOF.
    ///
    /// With multiline enabled, residual bytes with no trailing separator
    /// are flushed through the aggregator as a final line and the offset
    /// advances past them; without it they stay unread for the next call.
    pub fn read_once<F: FnMut(String)>(&mut self, mut emit: F) -> Result<()> {
        self.open()?;
        let result = self.drain_to_eof(&mut emit);
        self.cleanup();
        result
    }

    /// Like [`Tailer::read_once`], but at EOF sleeps briefly and resumes,
    /// until the tailer is stopped. Timeout-flushed multiline records are
    /// delivered during the idle phase without advancing the offset.
    pub fn run<F: FnMut(String)>(&mut self, mut emit: F) -> Result<()> {
        self.open()?;
        let result = loop {
            if self.shutdown.is_shutdown() {
                break Ok(());
            }
            match self.next_chunk() {
                Err(err) => break Err(err),
                Ok(Some(chunk)) => self.process_chunk(&chunk, &mut emit),
                Ok(None) => {
                    if let Some(agg) = &self.multiline {
                        while let Some(record) = agg.read() {
                            emit(into_record(record));
                        }
                    }
                    if self.shutdown.sleep(EOF_SLEEP) {
                        break Ok(());
                    }
                }
            }
        };
        self.cleanup();
        result
    }

    fn drain_to_eof(&mut self, emit: &mut dyn FnMut(String)) -> Result<()> {
        loop {
            if self.shutdown.is_shutdown() {
                return Ok(());
            }
            match self.next_chunk()? {
                Some(chunk) => self.process_chunk(&chunk, emit),
                None => {
                    self.consume_residual(emit);
                    return Ok(());
                }
            }
        }
    }

    fn open(&mut self) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        if self.separator.is_empty() {
            return Err(Error::Config("separator must not be empty".to_string()));
        }

        let tracked = self
            .registry
            .get(&self.id)
            .ok_or_else(|| Error::UntrackedFile(self.id.clone()))?;

        let mut file = File::open(&tracked.path)?;

        // Verify the handle still carries the expected identity; a rotation
        // or truncation at this path shows up as a different fingerprint.
        let actual = match tracked.strategy.compute(&mut file) {
            Ok(actual) => actual,
            Err(err) => {
                if err.is_skip() {
                    debug!(id = %self.id, path = %tracked.path.display(), %err,
                        "file no longer fingerprintable");
                }
                return Err(err.into());
            }
        };
        if actual != self.id {
            debug!(path = %tracked.path.display(), expected = %self.id, %actual,
                "file content changed, fingerprint mismatch");
            return Err(Error::FingerprintMismatch {
                path: tracked.path,
                expected: self.id.clone(),
                actual,
            });
        }

        file.seek(SeekFrom::Start(self.offset))?;
        self.file = Some(BufReader::new(file));
        if self.buf.is_none() {
            self.buf = Some(self.pool.acquire());
        }
        Ok(())
    }

    /// Extract the next separator-terminated chunk, separator included.
    /// `None` means EOF with no complete chunk; partial bytes remain in the
    /// internal buffer.
    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        // Reading up to the separator's last byte bounds each read at a
        // candidate match without scanning for the full sequence in the
        // reader.
        let anchor = *self.separator.last().expect("separator is non-empty");
        loop {
            let buf = self.buf.as_mut().expect("buffer acquired at open");
            if let Some(idx) = find_subsequence(buf, &self.separator) {
                let end = idx + self.separator.len();
                let chunk = buf[..end].to_vec();
                buf.drain(..end);
                return Ok(Some(chunk));
            }

            let reader = self.file.as_mut().expect("file opened");
            let n = reader.read_until(anchor, buf)?;
            if n == 0 {
                return Ok(None);
            }
        }
    }

    fn process_chunk(&mut self, chunk: &[u8], emit: &mut dyn FnMut(String)) {
        let body = &chunk[..chunk.len() - self.separator.len()];
        match &self.multiline {
            Some(agg) => {
                agg.write(body);
                while let Some(record) = agg.read() {
                    emit(into_record(record));
                }
            }
            None => {
                if !body.is_empty() {
                    emit(into_record(body.to_vec()));
                }
            }
        }
        // Blank chunks (separator only) still advance the offset.
        self.offset += chunk.len() as u64;
    }

    /// One-shot EOF handling for multiline: the unterminated tail becomes
    /// the record's final line and its bytes count as consumed.
    fn consume_residual(&mut self, emit: &mut dyn FnMut(String)) {
        let Some(agg) = &self.multiline else {
            return;
        };
        let buf = self.buf.as_mut().expect("buffer acquired at open");
        if !buf.is_empty() {
            agg.write(buf);
            self.offset += buf.len() as u64;
            buf.clear();
        }
        agg.flush();
        while let Some(record) = agg.read() {
            emit(into_record(record));
        }
    }

    fn cleanup(&mut self) {
        self.file = None;
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

fn into_record(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
