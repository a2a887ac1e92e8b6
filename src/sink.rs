// SPDX-License-Identifier: Apache-2.0

//! Downstream consumer interface.
//!
//! The collector itself only knows about the `on_record` callback; a sink
//! is any consumer behind that callback. Batching and backpressure are the
//! sink's business. Emission is synchronous on the worker thread, so a
//! slow sink slows ingestion rather than growing an unbounded queue.

use std::sync::Arc;

use crate::config::RecordCallback;
use crate::error::Result;

/// A record consumer. Implementations must tolerate concurrent `enqueue`
/// calls from multiple workers.
pub trait Sink: Send + Sync {
    fn enqueue(&self, record: String);

    /// Flush and release resources. Called by the embedder after the
    /// collector has stopped.
    fn stop(&self) -> Result<()>;
}

/// Adapt a sink into the collector's `on_record` callback.
pub fn callback_for(sink: Arc<dyn Sink>) -> RecordCallback {
    Arc::new(move |record| sink.enqueue(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct VecSink {
        records: Mutex<Vec<String>>,
        stopped: Mutex<bool>,
    }

    impl Sink for VecSink {
        fn enqueue(&self, record: String) {
            self.records.lock().unwrap().push(record);
        }

        fn stop(&self) -> Result<()> {
            *self.stopped.lock().unwrap() = true;
            Ok(())
        }
    }

    #[test]
    fn test_callback_forwards_to_sink() {
        let sink = Arc::new(VecSink {
            records: Mutex::new(Vec::new()),
            stopped: Mutex::new(false),
        });
        let callback = callback_for(sink.clone());

        callback("one".to_string());
        callback("two".to_string());

        assert_eq!(*sink.records.lock().unwrap(), vec!["one", "two"]);
        sink.stop().unwrap();
        assert!(*sink.stopped.lock().unwrap());
    }
}
