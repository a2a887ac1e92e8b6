// SPDX-License-Identifier: Apache-2.0

//! Multi-line aggregation: groups physical lines into logical records.
//!
//! Lines are matched against a start pattern (does this line begin a
//! record?) and a condition pattern (how does this line relate to the
//! record being accumulated?). The four modes differ only in what a
//! condition match means while a record is open. Accumulated lines are
//! joined with a single `\n`.
//!
//! A timer thread flushes the open record after it has been idle longer
//! than the configured timeout, publishing it on a bounded channel with a
//! non-blocking send; the internal queue remains authoritative. This is the
//! only way a record can surface while its file sits at EOF.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use regex::bytes::Regex;

use crate::config::{MultilineConfig, MultilineMode};
use crate::error::Result;
use crate::shutdown::{shutdown_channel, Shutdown, ShutdownSignal};

const OUT_CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
struct AggState {
    /// Record currently being assembled, without trailing separator.
    buf: Vec<u8>,
    /// Completed records awaiting `read`.
    queue: VecDeque<Vec<u8>>,
    /// Last time `buf` changed; drives the idle timeout.
    last: Option<Instant>,
}

impl AggState {
    fn append_line(&mut self, line: &[u8]) {
        if !self.buf.is_empty() {
            self.buf.push(b'\n');
        }
        self.buf.extend_from_slice(line);
        self.last = Some(Instant::now());
    }

    fn start_record(&mut self, line: &[u8]) {
        self.buf = line.to_vec();
        self.last = Some(Instant::now());
    }
}

pub struct MultilineAggregator {
    mode: MultilineMode,
    start_re: Regex,
    condition_re: Regex,
    state: Arc<Mutex<AggState>>,
    out_tx: flume::Sender<Vec<u8>>,
    out_rx: flume::Receiver<Vec<u8>>,
    timer: Option<JoinHandle<()>>,
    signal: Option<ShutdownSignal>,
}

impl MultilineAggregator {
    /// Build an aggregator and start its timeout timer thread.
    pub fn new(config: &MultilineConfig) -> Result<Self> {
        config.validate()?;

        let start_re = Regex::new(&config.start_pattern)?;
        let condition_re = Regex::new(&config.condition_pattern)?;
        let state = Arc::new(Mutex::new(AggState::default()));
        let (out_tx, out_rx) = flume::bounded(OUT_CHANNEL_CAPACITY);
        let (signal, shutdown) = shutdown_channel();

        let timer = spawn_timer(
            state.clone(),
            out_tx.clone(),
            config.timeout,
            shutdown,
        );

        Ok(Self {
            mode: config.mode,
            start_re,
            condition_re,
            state,
            out_tx,
            out_rx,
            timer: Some(timer),
            signal: Some(signal),
        })
    }

    /// Ingest one physical line (without its separator).
    pub fn write(&self, line: &[u8]) {
        let mut state = self.state.lock().unwrap();

        if state.buf.is_empty() {
            if self.start_re.is_match(line) {
                state.start_record(line);
            } else {
                // Not a record start: pass through as a standalone record.
                push_record(&mut state, &self.out_tx, line.to_vec());
            }
            return;
        }

        let matches = self.condition_re.is_match(line);
        match self.mode {
            MultilineMode::ContinuePast => {
                state.append_line(line);
                if !matches {
                    complete_current(&mut state, &self.out_tx);
                }
            }
            MultilineMode::ContinueThrough => {
                if matches {
                    state.append_line(line);
                } else {
                    complete_current(&mut state, &self.out_tx);
                    if self.start_re.is_match(line) {
                        state.start_record(line);
                    } else {
                        push_record(&mut state, &self.out_tx, line.to_vec());
                    }
                }
            }
            MultilineMode::HaltBefore => {
                if matches {
                    complete_current(&mut state, &self.out_tx);
                    if self.start_re.is_match(line) {
                        state.start_record(line);
                    } else {
                        push_record(&mut state, &self.out_tx, line.to_vec());
                    }
                } else {
                    state.append_line(line);
                }
            }
            MultilineMode::HaltWith => {
                state.append_line(line);
                if matches {
                    complete_current(&mut state, &self.out_tx);
                }
            }
        }
    }

    /// Next completed record, if any.
    pub fn read(&self) -> Option<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        state.queue.pop_front()
    }

    /// Promote the record being assembled (if any) to the queue.
    pub fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        complete_current(&mut state, &self.out_tx);
    }

    /// Channel carrying completed records, including timeout flushes.
    /// Delivery is best-effort (sends never block); the queue drained by
    /// [`MultilineAggregator::read`] is authoritative.
    pub fn receiver(&self) -> flume::Receiver<Vec<u8>> {
        self.out_rx.clone()
    }

    /// Stop the timer thread. Called automatically on drop.
    pub fn close(&mut self) {
        if let Some(signal) = self.signal.take() {
            signal.shutdown();
        }
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
    }
}

impl Drop for MultilineAggregator {
    fn drop(&mut self) {
        self.close();
    }
}

fn complete_current(state: &mut AggState, out_tx: &flume::Sender<Vec<u8>>) {
    if state.buf.is_empty() {
        return;
    }
    let record = std::mem::take(&mut state.buf);
    state.last = None;
    push_record(state, out_tx, record);
}

fn push_record(state: &mut AggState, out_tx: &flume::Sender<Vec<u8>>, record: Vec<u8>) {
    state.queue.push_back(record.clone());
    let _ = out_tx.try_send(record);
}

fn spawn_timer(
    state: Arc<Mutex<AggState>>,
    out_tx: flume::Sender<Vec<u8>>,
    timeout: Duration,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    // Granularity finer than the timeout so flushes are not late by a
    // whole period.
    let interval = timeout / 4;
    let interval = if interval.is_zero() { timeout } else { interval };

    std::thread::spawn(move || loop {
        if shutdown.sleep(interval) {
            return;
        }
        let mut state = state.lock().unwrap();
        let idle = state
            .last
            .map(|last| last.elapsed() >= timeout)
            .unwrap_or(false);
        if idle && !state.buf.is_empty() {
            complete_current(&mut state, &out_tx);
        }
    })
}
