use crate::stream_channel::StreamIndex;

/// Conditions that terminate a role. Everything recoverable (sync timeouts, loss signals) is
///  handled by the role's own state machine and never surfaces here.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("{operation} failed: {source:#}")]
    Transport {
        operation: &'static str,
        source: anyhow::Error,
    },
    #[error("data buffer allocation timed out on stream {stream}")]
    BufferTimeout { stream: StreamIndex },
    #[error("waiting for a send credit timed out on stream {stream}")]
    CreditTimeout { stream: StreamIndex },
    #[error("transport event channel closed")]
    EventChannelClosed,
}

impl FatalError {
    pub fn transport(operation: &'static str) -> impl FnOnce(anyhow::Error) -> FatalError {
        move |source| FatalError::Transport { operation, source }
    }
}
