use std::path::PathBuf;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::text_buffer::TextBuffer;
use crate::clock::{Clock, SystemClock};
use crate::config::BufferConfig;
use crate::document_model::LineEnding;
use crate::error::Result;
use crate::history::HistoryState;
use crate::markers::MarkerStoreState;

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBufferState {
    pub version: u32,
    pub text: String,
    pub saved_text: String,
    pub preferred_line_ending: Option<LineEnding>,
    pub path: Option<PathBuf>,
    pub markers: MarkerStoreState,
    pub history: HistoryState,
}

impl TextBuffer {
    pub fn serialize(&self) -> TextBufferState {
        TextBufferState {
            version: STATE_VERSION,
            text: self.get_text(),
            saved_text: self.saved_text.clone(),
            preferred_line_ending: self.preferred_line_ending,
            path: self.path.clone(),
            markers: self.markers.serialize(),
            history: self.history.serialize(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.serialize())?)
    }

    /// Rebuilds a buffer. `None` when the state, or any part of it, was
    /// written by another version.
    pub fn deserialize(state: &TextBufferState, config: BufferConfig) -> Option<Self> {
        Self::deserialize_with_clock(state, config, Rc::new(SystemClock))
    }

    pub fn deserialize_with_clock(
        state: &TextBufferState,
        config: BufferConfig,
        clock: Rc<dyn Clock>,
    ) -> Option<Self> {
        if state.version != STATE_VERSION {
            warn!(
                found = state.version,
                expected = STATE_VERSION,
                "ignoring buffer state with mismatched version"
            );
            return None;
        }
        let mut buffer = Self::with_clock(&state.text, config, clock);
        if !buffer.markers.deserialize(&state.markers) || !buffer.history.deserialize(&state.history) {
            return None;
        }
        buffer.saved_text = state.saved_text.clone();
        buffer.preferred_line_ending = state.preferred_line_ending;
        buffer.path = state.path.clone();
        Some(buffer)
    }

    pub fn from_json(json: &str, config: BufferConfig) -> Result<Option<Self>> {
        let state: TextBufferState = serde_json::from_str(json)?;
        Ok(Self::deserialize(&state, config))
    }
}
