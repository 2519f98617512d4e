use std::path::PathBuf;
use std::rc::Rc;

use similar::{ChangeTag, TextDiff};
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::config::BufferConfig;
use crate::document_model::line_ending::{byte_index, char_len, split_lines, text_extent};
use crate::document_model::{Dimension, LineEnding, OffsetIndex, Position, Range, Span};
use crate::error::{BufferError, Result};
use crate::events::{Emitter, SubscriptionId};
use crate::history::{Change, History};
use crate::marker_index::MarkerId;
use crate::markers::{MarkerParams, MarkerSnapshot, MarkerStore};

/// Notifications published by a [`TextBuffer`].
#[derive(Debug, Clone, PartialEq)]
pub enum BufferEvent {
    /// About to apply the change. The text still reads as before.
    WillChange(Change),
    DidChange(Change),
    DidStopChanging,
    DidSave(PathBuf),
    DidReload,
}

/// Per-edit switches for [`TextBuffer::set_text_in_range_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EditOptions {
    /// Overrides the configured line ending normalization for this edit.
    pub normalize_line_endings: Option<bool>,
    /// Apply without recording history or opening a transaction.
    pub skip_undo: bool,
}

/// Lines of text with their exact terminators, plus everything that must
/// move in step with them: the offset index, markers and history.
#[derive(Debug)]
pub struct TextBuffer {
    pub(super) lines: Vec<String>,
    pub(super) line_endings: Vec<String>,
    pub(super) offset_index: OffsetIndex,
    pub(super) markers: MarkerStore,
    pub(super) history: History,
    pub(super) clock: Rc<dyn Clock>,
    pub(super) config: BufferConfig,
    pub(super) preferred_line_ending: Option<LineEnding>,
    pub(super) path: Option<PathBuf>,
    /// Text as of the last load or save. The buffer is modified whenever it differs.
    pub(super) saved_text: String,
    pub(super) transaction_depth: usize,
    pub(super) last_change_at: Option<u64>,
    pub(super) emitter: Emitter<BufferEvent>,
}

impl Default for TextBuffer {
    fn default() -> Self {
        Self::new("")
    }
}

impl TextBuffer {
    pub fn new(text: &str) -> Self {
        Self::with_config(text, BufferConfig::default())
    }

    pub fn with_config(text: &str, config: BufferConfig) -> Self {
        Self::with_clock(text, config, Rc::new(SystemClock))
    }

    pub fn with_clock(text: &str, config: BufferConfig, clock: Rc<dyn Clock>) -> Self {
        let mut buffer = Self {
            lines: vec![String::new()],
            line_endings: vec![String::new()],
            offset_index: OffsetIndex::new(),
            markers: MarkerStore::new(),
            history: History::new(config.undo_levels, clock.clone()),
            clock,
            preferred_line_ending: config.preferred_line_ending,
            config,
            path: None,
            saved_text: String::new(),
            transaction_depth: 0,
            last_change_at: None,
            emitter: Emitter::new(),
        };
        buffer.reset_text(text);
        buffer.saved_text = text.to_string();
        buffer
    }

    /// Replaces every line without touching history, markers or listeners.
    pub(super) fn reset_text(&mut self, text: &str) {
        let (lines, line_endings): (Vec<String>, Vec<String>) = split_lines(text)
            .into_iter()
            .map(|(line, ending)| (line.to_string(), ending.to_string()))
            .unzip();
        let spans = line_spans(&lines, &line_endings);
        let old_count = self.offset_index.len();
        self.offset_index
            .splice_array(Dimension::Rows, 0, old_count, &spans);
        self.lines = lines;
        self.line_endings = line_endings;
    }

    pub fn subscribe<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&BufferEvent) + 'static,
    {
        self.emitter.subscribe(handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.emitter.unsubscribe(id)
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn markers(&self) -> &MarkerStore {
        &self.markers
    }

    pub fn markers_mut(&mut self) -> &mut MarkerStore {
        &mut self.markers
    }

    pub fn get_text(&self) -> String {
        let mut text = String::with_capacity(self.max_character_index());
        for (line, ending) in self.lines.iter().zip(&self.line_endings) {
            text.push_str(line);
            text.push_str(ending);
        }
        text
    }

    pub fn get_text_in_range(&self, range: Range) -> String {
        let range = self.clip_range(range);
        let (start, end) = (range.start, range.end);
        if start.row == end.row {
            let line = &self.lines[start.row];
            return line[byte_index(line, start.column)..byte_index(line, end.column)].to_string();
        }

        let first = &self.lines[start.row];
        let mut text = first[byte_index(first, start.column)..].to_string();
        text.push_str(&self.line_endings[start.row]);
        for row in start.row + 1..end.row {
            text.push_str(&self.lines[row]);
            text.push_str(&self.line_endings[row]);
        }
        let last = &self.lines[end.row];
        text.push_str(&last[..byte_index(last, end.column)]);
        text
    }

    pub fn line_for_row(&self, row: usize) -> Option<&str> {
        self.lines.get(row).map(String::as_str)
    }

    /// The terminator ending `row`. Empty for the last row.
    pub fn line_ending_for_row(&self, row: usize) -> Option<&str> {
        self.line_endings.get(row).map(String::as_str)
    }

    pub fn line_length_for_row(&self, row: usize) -> Option<usize> {
        self.lines.get(row).map(|line| char_len(line))
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn last_row(&self) -> usize {
        self.lines.len() - 1
    }

    pub fn end_position(&self) -> Position {
        let row = self.last_row();
        Position::new(row, char_len(&self.lines[row]))
    }

    pub fn get_range(&self) -> Range {
        Range::new(Position::ZERO, self.end_position())
    }

    pub fn max_character_index(&self) -> usize {
        self.offset_index.total().characters
    }

    pub fn is_empty(&self) -> bool {
        self.lines.len() == 1 && self.lines[0].is_empty()
    }

    pub fn is_row_blank(&self, row: usize) -> bool {
        self.lines
            .get(row)
            .is_some_and(|line| line.trim().is_empty())
    }

    /// The span of `row`, reaching the start of the next row when
    /// `include_newline` is set and one exists.
    pub fn range_for_row(&self, row: usize, include_newline: bool) -> Range {
        let row = row.min(self.last_row());
        let start = Position::new(row, 0);
        if include_newline && row < self.last_row() {
            Range::new(start, Position::new(row + 1, 0))
        } else {
            Range::new(start, Position::new(row, char_len(&self.lines[row])))
        }
    }

    /// Nearest position that exists in the document.
    pub fn clip_position(&self, position: Position) -> Position {
        if position.row > self.last_row() {
            return self.end_position();
        }
        let length = char_len(&self.lines[position.row]);
        Position::new(position.row, position.column.min(length))
    }

    pub fn clip_range(&self, range: Range) -> Range {
        Range::new(self.clip_position(range.start), self.clip_position(range.end))
    }

    pub fn character_index_for_position(&self, position: Position) -> usize {
        let position = self.clip_position(position);
        self.offset_index
            .total_to(position.row, Dimension::Rows)
            .characters
            + position.column
    }

    /// Offsets inside a line terminator land at the end of that line.
    pub fn position_for_character_index(&self, index: usize) -> Position {
        let index = index.min(self.max_character_index());
        let span = self.offset_index.total_to(index, Dimension::Characters);
        if span.rows > self.last_row() {
            return self.end_position();
        }
        self.clip_position(Position::new(span.rows, index - span.characters))
    }

    pub fn preferred_line_ending(&self) -> Option<LineEnding> {
        self.preferred_line_ending
    }

    /// Sets the terminator forced onto inserted text. Existing text keeps its endings.
    pub fn set_preferred_line_ending(&mut self, ending: Option<LineEnding>) {
        self.preferred_line_ending = ending;
    }

    pub fn set_text_in_range(&mut self, range: Range, text: &str) -> Result<Range> {
        self.set_text_in_range_with(range, text, EditOptions::default())
    }

    /// Replaces `range` with `text` and returns the range the new text occupies.
    /// Outside a transaction the edit runs inside its own.
    pub fn set_text_in_range_with(
        &mut self,
        range: Range,
        text: &str,
        options: EditOptions,
    ) -> Result<Range> {
        let normalize = options
            .normalize_line_endings
            .unwrap_or(self.config.normalize_line_endings);
        if options.skip_undo {
            let new_range = self.apply_change(range, text, normalize, false)?;
            self.markers.emit_change_events(true);
            return Ok(new_range);
        }
        if self.transaction_depth > 0 {
            return self.apply_change(range, text, normalize, true);
        }
        let text = text.to_string();
        self.transact(None, move |buffer| {
            buffer.apply_change(range, &text, normalize, true)
        })?
        .ok_or(BufferError::TransactionAborted)
    }

    /// Replaces the whole text with a minimal sequence of line edits, as one
    /// undo step. Line endings are kept exactly as given.
    pub fn set_text(&mut self, text: &str) -> Result<()> {
        let old_text = self.get_text();
        let diff = TextDiff::from_lines(old_text.as_str(), text);
        let edits: Vec<(ChangeTag, String)> = diff
            .iter_all_changes()
            .map(|change| (change.tag(), change.value().to_string()))
            .collect();

        self.transact(None, move |buffer| {
            let mut cursor = Position::ZERO;
            for (tag, value) in &edits {
                let extent = text_extent(value);
                match tag {
                    ChangeTag::Equal => cursor = cursor.traverse(extent),
                    ChangeTag::Delete => {
                        let range = Range::from_point_with_delta(cursor, extent);
                        buffer.apply_change(range, "", false, true)?;
                    }
                    ChangeTag::Insert => {
                        buffer.apply_change(Range::empty_at(cursor), value, false, true)?;
                        cursor = cursor.traverse(extent);
                    }
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    pub fn insert(&mut self, position: Position, text: &str) -> Result<Range> {
        self.set_text_in_range(Range::empty_at(position), text)
    }

    pub fn append(&mut self, text: &str) -> Result<Range> {
        self.insert(self.end_position(), text)
    }

    pub fn delete(&mut self, range: Range) -> Result<Range> {
        self.set_text_in_range(range, "")
    }

    pub fn delete_row(&mut self, row: usize) -> Result<Range> {
        self.delete_rows(row, row)
    }

    /// Removes whole rows together with one adjoining terminator.
    pub fn delete_rows(&mut self, start_row: usize, end_row: usize) -> Result<Range> {
        let last_row = self.last_row();
        let (start_row, end_row) = if start_row <= end_row {
            (start_row, end_row)
        } else {
            (end_row, start_row)
        };
        let end_row = end_row.min(last_row);
        let start_row = start_row.min(end_row);

        let range = if end_row < last_row {
            Range::new(Position::new(start_row, 0), Position::new(end_row + 1, 0))
        } else if start_row == 0 {
            Range::new(Position::ZERO, self.range_for_row(end_row, false).end)
        } else {
            Range::new(
                self.range_for_row(start_row - 1, false).end,
                self.range_for_row(end_row, false).end,
            )
        };
        self.delete(range)
    }

    /// The one place text changes. Splices lines, the offset index and
    /// markers together, then records and publishes the change.
    pub(super) fn apply_change(
        &mut self,
        range: Range,
        text: &str,
        normalize: bool,
        record: bool,
    ) -> Result<Range> {
        let old_range = self.clip_range(range);
        let new_text = if normalize {
            self.normalize_line_endings(text, old_range.start.row)
        } else {
            text.to_string()
        };
        let change = Change {
            old_range,
            new_range: Range::from_text(old_range.start, &new_text),
            old_text: self.get_text_in_range(old_range),
            new_text,
        };
        self.emitter.emit(&BufferEvent::WillChange(change.clone()));

        self.splice_lines(old_range, &change.new_text);
        self.markers.splice(
            old_range.start,
            old_range.extent(),
            change.new_range.extent(),
        );
        self.last_change_at = Some(self.clock.now_millis());

        let new_range = change.new_range;
        if record {
            self.history.push_change(change.clone())?;
        }
        self.emitter.emit(&BufferEvent::DidChange(change));
        Ok(new_range)
    }

    fn splice_lines(&mut self, range: Range, text: &str) {
        let (start, end) = (range.start, range.end);
        let start_line = &self.lines[start.row];
        let prefix = start_line[..byte_index(start_line, start.column)].to_string();
        let end_line = &self.lines[end.row];
        let suffix = end_line[byte_index(end_line, end.column)..].to_string();
        let suffix_ending = self.line_endings[end.row].clone();

        let pieces = split_lines(text);
        let last = pieces.len() - 1;
        let mut new_lines = Vec::with_capacity(pieces.len());
        let mut new_endings = Vec::with_capacity(pieces.len());
        for (i, (line, ending)) in pieces.into_iter().enumerate() {
            let mut content = String::new();
            if i == 0 {
                content.push_str(&prefix);
            }
            content.push_str(line);
            if i == last {
                content.push_str(&suffix);
                new_endings.push(suffix_ending.clone());
            } else {
                new_endings.push(ending.to_string());
            }
            new_lines.push(content);
        }

        let spans = line_spans(&new_lines, &new_endings);
        self.lines.splice(start.row..=end.row, new_lines);
        self.line_endings.splice(start.row..=end.row, new_endings);
        self.offset_index.splice_array(
            Dimension::Rows,
            start.row,
            end.row - start.row + 1,
            &spans,
        );
    }

    /// Rewrites every terminator in `text` to the preferred ending, else the
    /// ending of `row`, else the ending of the row above.
    pub(super) fn normalize_line_endings(&self, text: &str, row: usize) -> String {
        let ending = self
            .preferred_line_ending
            .map(|ending| ending.as_str())
            .or_else(|| non_empty(self.line_endings.get(row)))
            .or_else(|| {
                row.checked_sub(1)
                    .and_then(|above| non_empty(self.line_endings.get(above)))
            });
        let Some(ending) = ending else {
            return text.to_string();
        };
        let mut normalized = String::with_capacity(text.len());
        for (line, terminator) in split_lines(text) {
            normalized.push_str(line);
            if !terminator.is_empty() {
                normalized.push_str(ending);
            }
        }
        normalized
    }

    /// Runs `work` as one undoable unit. If `work` fails the buffer reverts
    /// to where it was. `Err(TransactionAborted)` is swallowed into `Ok(None)`;
    /// any other error is returned after the revert.
    ///
    /// Transactions nest. Only the outermost applies `grouping_interval`
    /// (falling back to the configured one) and flushes marker events.
    pub fn transact<T, F>(&mut self, grouping_interval: Option<u64>, work: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let snapshot = self.markers.create_snapshot(false);
        let checkpoint = self.history.create_checkpoint(snapshot, true);

        self.transaction_depth += 1;
        let outcome = work(self);
        self.transaction_depth -= 1;

        let value = match outcome {
            Ok(value) => value,
            Err(err) => {
                debug!(%err, checkpoint, "transaction failed, reverting");
                if !self.revert_to_checkpoint(checkpoint)? {
                    return Err(BufferError::InvalidHistoryState(
                        "transaction checkpoint missing from undo stack",
                    ));
                }
                return match err {
                    BufferError::TransactionAborted => Ok(None),
                    other => Err(other),
                };
            }
        };

        let outermost = self.transaction_depth == 0;
        let end_snapshot = self.markers.create_snapshot(outermost);
        self.history
            .group_changes_since_checkpoint(checkpoint, end_snapshot, true);
        if outermost {
            let interval = grouping_interval.unwrap_or(self.config.group_interval);
            self.history.apply_grouping_interval(interval)?;
        }
        Ok(Some(value))
    }

    pub fn undo(&mut self) -> Result<bool> {
        let Some(pop) = self.history.pop_undo_stack()? else {
            return Ok(false);
        };
        self.replay(pop.changes, pop.snapshot.as_ref())?;
        Ok(true)
    }

    pub fn redo(&mut self) -> Result<bool> {
        let Some(pop) = self.history.pop_redo_stack()? else {
            return Ok(false);
        };
        self.replay(pop.changes, pop.snapshot.as_ref())?;
        Ok(true)
    }

    pub fn has_undo(&self) -> bool {
        self.history.has_undo()
    }

    pub fn has_redo(&self) -> bool {
        self.history.has_redo()
    }

    pub fn create_checkpoint(&mut self) -> u64 {
        let snapshot = self.markers.create_snapshot(false);
        self.history.create_checkpoint(snapshot, false)
    }

    /// Undoes everything after `checkpoint` and forgets it. Returns false if
    /// the checkpoint is gone or a transaction boundary lies in between.
    pub fn revert_to_checkpoint(&mut self, checkpoint: u64) -> Result<bool> {
        let Some(pop) = self.history.truncate_undo_stack(checkpoint)? else {
            return Ok(false);
        };
        debug!(checkpoint, changes = pop.changes.len(), "reverting to checkpoint");
        self.replay(pop.changes, pop.snapshot.as_ref())?;
        Ok(true)
    }

    pub fn group_changes_since_checkpoint(&mut self, checkpoint: u64) -> bool {
        let snapshot = self.markers.create_snapshot(false);
        self.history
            .group_changes_since_checkpoint(checkpoint, snapshot, false)
    }

    pub fn get_changes_since_checkpoint(&self, checkpoint: u64) -> Option<Vec<Change>> {
        self.history.get_changes_since_checkpoint(checkpoint)
    }

    pub fn clear_undo_stack(&mut self) {
        self.history.clear_undo_stack();
    }

    fn replay(&mut self, changes: Vec<Change>, snapshot: Option<&MarkerSnapshot>) -> Result<()> {
        for change in changes {
            self.apply_change(change.old_range, &change.new_text, false, false)?;
        }
        if let Some(snapshot) = snapshot {
            self.markers.restore_from_snapshot(snapshot);
        }
        self.markers.emit_change_events(true);
        Ok(())
    }

    pub fn is_modified(&self) -> bool {
        self.get_text() != self.saved_text
    }

    /// Publishes `DidStopChanging` once the configured delay has passed
    /// since the last edit. Returns whether it fired.
    pub fn check_stopped_changing(&mut self) -> bool {
        let Some(changed_at) = self.last_change_at else {
            return false;
        };
        let elapsed = self.clock.now_millis().saturating_sub(changed_at);
        if elapsed < self.config.stopped_changing_delay {
            return false;
        }
        self.last_change_at = None;
        self.emitter.emit(&BufferEvent::DidStopChanging);
        true
    }

    pub fn mark_range(&mut self, range: Range, params: MarkerParams) -> MarkerId {
        let range = self.clip_range(range);
        self.markers.mark_range(range, params)
    }

    pub fn mark_position(&mut self, position: Position, params: MarkerParams) -> MarkerId {
        let position = self.clip_position(position);
        self.markers.mark_position(position, params)
    }
}

fn line_spans(lines: &[String], endings: &[String]) -> Vec<Span> {
    lines
        .iter()
        .zip(endings)
        .map(|(line, ending)| Span::line(char_len(line) + char_len(ending)))
        .collect()
}

fn non_empty(ending: Option<&String>) -> Option<&str> {
    ending.map(String::as_str).filter(|ending| !ending.is_empty())
}
