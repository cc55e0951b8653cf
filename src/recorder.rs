//! Event sequencing and dispatch.
//!
//! One recorder is shared by every resource of an installation. Its global
//! counters are the only state mutated from many connections at once; per
//! resource ordering is kept by holding that resource's sequence lock while
//! the sink receives the event.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use chrono::Utc;

use crate::event::{Event, EventMeta, ResourceId};
use crate::kernel::ResourceState;
use crate::sink::Sink;

/// Counters describing what the recorder did with emitted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecorderStats {
    pub emitted: u64,
    pub delivered: u64,
    pub sink_failures: u64,
}

pub(crate) struct Recorder {
    sink: Arc<dyn Sink>,
    next_resource: AtomicU64,
    global_sequence: AtomicU64,
    delivered: AtomicU64,
    sink_failures: AtomicU64,
}

impl Recorder {
    pub(crate) fn new(sink: Arc<dyn Sink>) -> Self {
        Self {
            sink,
            next_resource: AtomicU64::new(1),
            global_sequence: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
        }
    }

    pub(crate) fn allocate_id(&self) -> ResourceId {
        ResourceId(self.next_resource.fetch_add(1, Ordering::Relaxed))
    }

    /// Stamp and deliver an event originating from `origin`. Never fails.
    pub(crate) fn emit(&self, origin: &ResourceState, build: impl FnOnce(EventMeta) -> Event) {
        let mut next = origin
            .sequence()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let meta = EventMeta {
            resource: origin.id(),
            kind: origin.kind(),
            lineage: origin.lineage(),
            sequence: *next,
            global_sequence: self.global_sequence.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
        };
        *next += 1;
        let event = build(meta);
        self.dispatch(&event);
    }

    fn dispatch(&self, event: &Event) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| match event {
            Event::Lifecycle(event) => self.sink.on_lifecycle_event(event),
            Event::Execution(event) => self.sink.on_execution_event(event),
        }));
        match result {
            Ok(Ok(())) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(error)) => {
                self.sink_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(error = %error, resource = %event.meta().resource, "Sink rejected event");
            }
            Err(_) => {
                self.sink_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(resource = %event.meta().resource, "Sink panicked");
            }
        }
    }

    pub(crate) fn stats(&self) -> RecorderStats {
        let delivered = self.delivered.load(Ordering::Relaxed);
        let sink_failures = self.sink_failures.load(Ordering::Relaxed);
        RecorderStats {
            emitted: delivered + sink_failures,
            delivered,
            sink_failures,
        }
    }
}
