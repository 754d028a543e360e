//! Status reporting sink.

/// Receives human-readable progress and result strings.
///
/// Implementations must be fire-and-forget: the engine never waits for
/// acknowledgement and calls from inside tight loops.
pub trait StatusSink: Send + Sync {
    /// An operation is in progress; `message` describes the current step.
    fn waiting(&self, message: &str);

    /// An operation finished normally.
    fn done(&self, message: &str);

    /// A blocking error the user must act on.
    fn error(&self, message: &str);

    /// A markdown-formatted summary (e.g. a list of skipped assets).
    fn markdown(&self, message: &str);
}

/// Sink that routes everything to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl StatusSink for LogSink {
    fn waiting(&self, message: &str) {
        log::debug!("{message}");
    }

    fn done(&self, message: &str) {
        log::info!("{message}");
    }

    fn error(&self, message: &str) {
        log::error!("{message}");
    }

    fn markdown(&self, message: &str) {
        log::info!("{message}");
    }
}
