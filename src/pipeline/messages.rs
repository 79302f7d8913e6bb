//! Types passed between the pipeline and its callers.

use std::fmt;

/// Lifecycle states of the voice pipeline.
///
/// `Unconfigured → Idle → Listening → Transcribing → Thinking → Speaking →
/// Idle`, with `Cancelled` reachable from any configured state and
/// `Interrupted` cutting from `Speaking` back to `Listening` on barge-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Unconfigured,
    Idle,
    Listening,
    Transcribing,
    Thinking,
    Speaking,
    Cancelled,
    Interrupted,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unconfigured => "unconfigured",
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Transcribing => "transcribing",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

/// One completed conversation turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRecord {
    /// What the user said (transcribed).
    pub user_text: String,
    /// What the assistant answered (possibly cut short by barge-in).
    pub assistant_text: String,
    /// Epoch seconds; strictly increasing across a conversation.
    pub timestamp_s: i64,
}
