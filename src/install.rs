//! Wrapping a data source.

use std::sync::Arc;

use crate::config::InstrumentationConfig;
use crate::driver::DataSource;
use crate::error::AlreadyInstrumentedError;
use crate::kernel::Scope;
use crate::recorder::Recorder;
use crate::sink::{Sink, TracingSink};
use crate::source::InstrumentedSource;

/// Wrap `source` so that everything obtained through it is instrumented.
///
/// A source that is already instrumented is handed back inside the error
/// rather than wrapped a second time, so no call is ever observed twice.
///
/// # Example
///
/// ```rust,ignore
/// let sink = Arc::new(MemorySink::new());
/// let source = sql_spy::install(SeaOrmSource::new(db), InstrumentationConfig::default(), sink)?;
/// ```
pub fn install<S: DataSource>(
    source: S,
    config: InstrumentationConfig,
    sink: Arc<dyn Sink>,
) -> Result<InstrumentedSource<S>, AlreadyInstrumentedError<S>> {
    if source.is_instrumented() {
        tracing::warn!("Data source is already instrumented, leaving it as is");
        return Err(AlreadyInstrumentedError::new(source));
    }

    let scope = Scope::new(config, Recorder::new(sink));
    let source = InstrumentedSource::new(source, scope);
    tracing::debug!(resource = %source.id(), "Instrumented data source");
    Ok(source)
}

/// Extension trait for instrumenting any [`DataSource`].
///
/// # Example
///
/// ```rust,ignore
/// use sql_spy::InstrumentExt;
///
/// let source = SeaOrmSource::new(db).instrument_with_tracing(InstrumentationConfig::production())?;
/// ```
pub trait InstrumentExt: DataSource + Sized {
    fn instrument(
        self,
        config: InstrumentationConfig,
        sink: Arc<dyn Sink>,
    ) -> Result<InstrumentedSource<Self>, AlreadyInstrumentedError<Self>> {
        install(self, config, sink)
    }

    /// Instrument and report through `tracing` with the default formatting.
    fn instrument_with_tracing(
        self,
        config: InstrumentationConfig,
    ) -> Result<InstrumentedSource<Self>, AlreadyInstrumentedError<Self>> {
        install(self, config, Arc::new(TracingSink::default()))
    }
}

impl<S: DataSource> InstrumentExt for S {}
