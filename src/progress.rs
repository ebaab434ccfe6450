//! # Stage State Machine
//!
//! A pure reducer over progress events pushed by the backend while a job is
//! running. The backend is the authority on stage sequencing, so this module
//! deliberately does not enforce transition legality — any tag may follow any
//! tag, events may repeat or arrive out of order, and the machine only keeps
//! the most recent event for display.
//!
//! What it does guarantee:
//! - `progress` is clamped to 0..=100 no matter what the wire carries
//! - unknown stage tags render as a generic "Processing" label instead of
//!   failing deserialization
//! - `(stage = completed, progress = 100)` is the single signal that the job
//!   finished successfully from the channel's point of view

use serde::{Deserialize, Serialize};

/// Progress bar color for failed jobs.
pub const COLOR_ERROR: &str = "#e74c3c";
/// Progress bar color for successfully completed jobs.
pub const COLOR_SUCCESS: &str = "#27ae60";
/// Progress bar color while a job is still running.
pub const COLOR_IN_PROGRESS: &str = "#3498db";

/// Named phase of backend processing.
///
/// The set is closed on the backend side; `Unknown` absorbs any tag this
/// client has not heard of (including legacy tags older backends still emit)
/// so a protocol addition never crashes a deployed client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageTag {
    Upload,
    Validation,
    Loading,
    Preparing,
    Segmenting,
    Splitting,
    Transcribing,
    Merging,
    TranscriptionComplete,
    Analysis,
    Completed,
    Error,
    /// Catch-all for tags not in the known set.
    #[serde(other)]
    Unknown,
}

impl StageTag {
    /// Human-readable label for this stage.
    pub fn label(&self) -> &'static str {
        match self {
            StageTag::Upload => "Uploading file",
            StageTag::Validation => "Validating file",
            StageTag::Loading => "Loading audio",
            StageTag::Preparing => "Preparing segments",
            StageTag::Segmenting => "Segmenting audio",
            StageTag::Splitting => "Splitting segments",
            StageTag::Transcribing => "Transcribing speech",
            StageTag::Merging => "Merging results",
            StageTag::TranscriptionComplete => "Transcription complete",
            StageTag::Analysis => "Analyzing with AI",
            StageTag::Completed => "Completed",
            StageTag::Error => "Error",
            StageTag::Unknown => "Processing",
        }
    }

    /// Progress bar color for this stage.
    pub fn color_class(&self) -> &'static str {
        match self {
            StageTag::Error => COLOR_ERROR,
            StageTag::Completed => COLOR_SUCCESS,
            _ => COLOR_IN_PROGRESS,
        }
    }

    /// Terminal stages end the job from the channel's perspective.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageTag::Completed | StageTag::Error)
    }
}

/// One progress frame pushed by the backend over the channel.
///
/// Extra fields on the wire (the backend also sends a `timestamp`) are
/// ignored. `progress` is kept wide and signed here; clamping happens in the
/// reducer so a misbehaving backend cannot push the display out of range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: StageTag,
    pub progress: i64,
    #[serde(default)]
    pub message: String,
}

/// Derived presentation view of the latest progress state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageView {
    pub label: &'static str,
    pub color_class: &'static str,
    pub percent: u8,
    pub message: String,
}

/// Latest-event slot plus the reduction rules.
///
/// There is no hidden state: the machine is exactly the most recent event
/// (clamped), so replaying any prefix of an event sequence always yields the
/// state after its last element.
#[derive(Debug, Clone, Default)]
pub struct ProgressState {
    latest: Option<ProgressEvent>,
}

impl ProgressState {
    /// Fold one event into the state. Each event supersedes the previous one;
    /// `progress` is clamped to 0..=100 here so downstream consumers never
    /// see an out-of-range percentage.
    pub fn apply(&mut self, mut event: ProgressEvent) {
        event.progress = event.progress.clamp(0, 100);
        self.latest = Some(event);
    }

    /// The most recently applied event, if any arrived yet.
    pub fn latest(&self) -> Option<&ProgressEvent> {
        self.latest.as_ref()
    }

    /// The single authoritative "job finished successfully" signal from the
    /// channel side: `completed` at exactly 100%.
    pub fn is_complete(&self) -> bool {
        matches!(
            self.latest,
            Some(ProgressEvent { stage: StageTag::Completed, progress: 100, .. })
        )
    }

    /// Whether the channel has reported a failed job.
    pub fn is_error(&self) -> bool {
        matches!(self.latest, Some(ProgressEvent { stage: StageTag::Error, .. }))
    }

    /// Presentation view for progress rendering. Before any event arrives the
    /// view is an empty in-progress bar at 0%.
    pub fn view(&self) -> StageView {
        match &self.latest {
            Some(event) => StageView {
                label: event.stage.label(),
                color_class: event.stage.color_class(),
                percent: event.progress.clamp(0, 100) as u8,
                message: event.message.clone(),
            },
            None => StageView {
                label: "Waiting",
                color_class: COLOR_IN_PROGRESS,
                percent: 0,
                message: String::new(),
            },
        }
    }
}
