#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Transient feedback, such as an acknowledged trigger.
    Silent,
    /// A result the user should notice.
    Event,
}

/// Receives the user facing messages of the engine.
pub trait StatusSink {
    fn message(&mut self, kind: MessageKind, text: &str);
}

/// Forwards messages to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl StatusSink for LogSink {
    fn message(&mut self, kind: MessageKind, text: &str) {
        match kind {
            MessageKind::Silent => log::debug!("{text}"),
            MessageKind::Event => log::info!("{text}"),
        }
    }
}
