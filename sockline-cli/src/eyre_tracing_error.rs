//! Error reports that name the spans they were created in.
//!
//! Every command runs inside an instrumented span carrying its transport and address, so listing
//! the active spans tells which peer or endpoint a failure belongs to.

use std::fmt;

use eyre::{DefaultHandler, EyreHandler, InstallError};
use tracing_error::{SpanTrace, SpanTraceStatus};

/// Installs [`Handler`] as the process-wide report handler.
///
/// Fails if a handler is already installed.
pub(crate) fn install() -> Result<(), InstallError> {
    eyre::set_hook(Box::new(Handler::hook))
}

/// Wraps [`DefaultHandler`], capturing the span trace when the report is created.
struct Handler {
    inner: Box<dyn EyreHandler>,
    spans: SpanTrace,
}

impl Handler {
    fn hook(error: &(dyn std::error::Error + 'static)) -> Box<dyn EyreHandler> {
        Box::new(Self {
            inner: DefaultHandler::default_with(error),
            spans: SpanTrace::capture(),
        })
    }

    /// One line per span, innermost first: `  <depth>: <target>::<name> <fields>`.
    fn write_spans(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\n\nIn spans:")?;

        let mut result = Ok(());
        let mut depth = 0;
        self.spans.with_spans(|metadata, fields| {
            result = write!(f, "\n  {depth}: {}::{}", metadata.target(), metadata.name())
                .and_then(|()| if fields.is_empty() { Ok(()) } else { write!(f, " {fields}") });
            depth += 1;
            result.is_ok()
        });
        result
    }
}

impl EyreHandler for Handler {
    fn debug(
        &self,
        error: &(dyn std::error::Error + 'static),
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        self.inner.debug(error, f)?;
        if self.spans.status() == SpanTraceStatus::CAPTURED {
            self.write_spans(f)?;
        }
        Ok(())
    }

    fn display(
        &self,
        error: &(dyn std::error::Error + 'static),
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        self.inner.display(error, f)
    }

    fn track_caller(&mut self, location: &'static std::panic::Location<'static>) {
        self.inner.track_caller(location);
    }
}
