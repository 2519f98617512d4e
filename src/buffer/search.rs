use regex::Regex;

use super::text_buffer::{EditOptions, TextBuffer};
use crate::document_model::line_ending::char_len;
use crate::document_model::{Position, Range};
use crate::error::Result;

/// One regex match handed to a scan callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanMatch {
    /// Where the match sits. A match cutting through a `\r\n` terminator
    /// is widened to cover the whole terminator.
    pub range: Range,
    pub match_text: String,
    /// Capture groups, index 0 being the whole match.
    pub captures: Vec<Option<String>>,
}

/// What a scan callback wants done with the match it was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanAction {
    Continue,
    Stop,
    Replace(String),
    ReplaceAndStop(String),
}

/// A match located in the text that was searched, in characters from the
/// start of the searched range.
struct FoundMatch {
    offset: usize,
    length: usize,
    captures: Vec<Option<String>>,
    /// Replacement with `$n` references expanded, when one was requested.
    expanded: Option<String>,
}

/// A match mapped onto buffer rows. `lead` and `trail` are the parts of a
/// split terminator lying outside the match; a replacement puts them back.
struct Located {
    range: Range,
    lead: String,
    trail: String,
}

impl TextBuffer {
    /// Visits every match in the document, first to last.
    pub fn scan<F>(&mut self, regex: &Regex, callback: F) -> Result<usize>
    where
        F: FnMut(&ScanMatch) -> ScanAction,
    {
        self.scan_in_range(regex, self.get_range(), callback)
    }

    pub fn backwards_scan<F>(&mut self, regex: &Regex, callback: F) -> Result<usize>
    where
        F: FnMut(&ScanMatch) -> ScanAction,
    {
        self.backwards_scan_in_range(regex, self.get_range(), callback)
    }

    /// Visits matches inside `range` in document order. Replacements shift
    /// the matches still to come by the length change they caused in the
    /// buffer. Returns the number of matches visited.
    pub fn scan_in_range<F>(&mut self, regex: &Regex, range: Range, mut callback: F) -> Result<usize>
    where
        F: FnMut(&ScanMatch) -> ScanAction,
    {
        let range = self.clip_range(range);
        let base = self.character_index_for_position(range.start);
        let found = find_matches(regex, &self.get_text_in_range(range), None);

        let mut delta: isize = 0;
        let mut visited = 0;
        for found in found {
            let start = (base + found.offset).saturating_add_signed(delta);
            let located = self.locate(start, found.length);
            let scan_match = scan_match(&located, found);
            visited += 1;
            let (replacement, stop) = split_action(callback(&scan_match));
            if let Some(replacement) = replacement {
                let old_end = self.character_index_for_position(located.range.end);
                let new_range = self.replace_located(&located, &replacement)?;
                let new_end = self.character_index_for_position(new_range.end);
                delta += new_end as isize - old_end as isize;
            }
            if stop {
                break;
            }
        }
        Ok(visited)
    }

    /// Visits matches inside `range` from last to first. Replacements never
    /// move the matches still to come.
    pub fn backwards_scan_in_range<F>(
        &mut self,
        regex: &Regex,
        range: Range,
        mut callback: F,
    ) -> Result<usize>
    where
        F: FnMut(&ScanMatch) -> ScanAction,
    {
        let range = self.clip_range(range);
        let base = self.character_index_for_position(range.start);
        let found = find_matches(regex, &self.get_text_in_range(range), None);

        let mut visited = 0;
        for found in found.into_iter().rev() {
            let located = self.locate(base + found.offset, found.length);
            let scan_match = scan_match(&located, found);
            visited += 1;
            let (replacement, stop) = split_action(callback(&scan_match));
            if let Some(replacement) = replacement {
                self.replace_located(&located, &replacement)?;
            }
            if stop {
                break;
            }
        }
        Ok(visited)
    }

    /// Replaces every match, expanding `$1`-style references in
    /// `replacement`, as one undo step. Returns how many were replaced.
    pub fn replace(&mut self, regex: &Regex, replacement: &str) -> Result<usize> {
        let found = find_matches(regex, &self.get_text(), Some(replacement));
        if found.is_empty() {
            return Ok(0);
        }
        let count = found.len();
        self.transact(None, |buffer| {
            for found in found.into_iter().rev() {
                let located = buffer.locate(found.offset, found.length);
                let text = found.expanded.unwrap_or_default();
                buffer.replace_located(&located, &text)?;
            }
            Ok(())
        })?;
        Ok(count)
    }

    /// Like [`TextBuffer::replace`] for a pattern that has not been compiled yet.
    pub fn replace_pattern(&mut self, pattern: &str, replacement: &str) -> Result<usize> {
        let regex = Regex::new(pattern)?;
        self.replace(&regex, replacement)
    }

    fn locate(&self, start: usize, length: usize) -> Located {
        let end = start + length;

        let start_position = self.position_for_character_index(start);
        let start_index = self.character_index_for_position(start_position);
        let lead = self
            .line_ending_for_row(start_position.row)
            .unwrap_or_default()
            .chars()
            .take(start.saturating_sub(start_index))
            .collect();

        let mut end_position = self.position_for_character_index(end);
        let end_index = self.character_index_for_position(end_position);
        let mut trail = String::new();
        if end_index < end && end_position.row < self.last_row() {
            trail = self
                .line_ending_for_row(end_position.row)
                .unwrap_or_default()
                .chars()
                .skip(end - end_index)
                .collect();
            end_position = Position::new(end_position.row + 1, 0);
        }

        Located {
            range: Range::new(start_position, end_position),
            lead,
            trail,
        }
    }

    fn replace_located(&mut self, located: &Located, replacement: &str) -> Result<Range> {
        if located.lead.is_empty() && located.trail.is_empty() {
            return self.set_text_in_range(located.range, replacement);
        }
        let replacement = if self.config.normalize_line_endings {
            self.normalize_line_endings(replacement, located.range.start.row)
        } else {
            replacement.to_string()
        };
        let text = format!("{}{}{}", located.lead, replacement, located.trail);
        let options = EditOptions {
            normalize_line_endings: Some(false),
            ..EditOptions::default()
        };
        self.set_text_in_range_with(located.range, &text, options)
    }
}

fn scan_match(located: &Located, found: FoundMatch) -> ScanMatch {
    let match_text = found
        .captures
        .first()
        .cloned()
        .flatten()
        .unwrap_or_default();
    ScanMatch {
        range: located.range,
        match_text,
        captures: found.captures,
    }
}

fn split_action(action: ScanAction) -> (Option<String>, bool) {
    match action {
        ScanAction::Continue => (None, false),
        ScanAction::Stop => (None, true),
        ScanAction::Replace(text) => (Some(text), false),
        ScanAction::ReplaceAndStop(text) => (Some(text), true),
    }
}

/// Every match of `regex` in `text` with byte offsets turned into character
/// offsets.
fn find_matches(regex: &Regex, text: &str, replacement: Option<&str>) -> Vec<FoundMatch> {
    let mut found = Vec::new();
    let mut chars_before = 0;
    let mut bytes_seen = 0;

    for captures in regex.captures_iter(text) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        chars_before += char_len(&text[bytes_seen..whole.start()]);
        bytes_seen = whole.start();

        let expanded = replacement.map(|replacement| {
            let mut expanded = String::new();
            captures.expand(replacement, &mut expanded);
            expanded
        });
        found.push(FoundMatch {
            offset: chars_before,
            length: char_len(whole.as_str()),
            captures: captures
                .iter()
                .map(|group| group.map(|group| group.as_str().to_string()))
                .collect(),
            expanded,
        });
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BufferError;
    use pretty_assertions::assert_eq;

    fn pos(row: usize, column: usize) -> Position {
        Position::new(row, column)
    }

    #[test]
    fn test_scan_reports_ranges_across_rows() {
        let mut buffer = TextBuffer::new("cat\nconcat\r\ncatalog");
        let regex = Regex::new("cat").unwrap();
        let mut ranges = Vec::new();

        let visited = buffer
            .scan(&regex, |found| {
                ranges.push(found.range);
                ScanAction::Continue
            })
            .unwrap();

        assert_eq!(visited, 3);
        assert_eq!(
            ranges,
            vec![
                Range::new(pos(0, 0), pos(0, 3)),
                Range::new(pos(1, 3), pos(1, 6)),
                Range::new(pos(2, 0), pos(2, 3)),
            ]
        );
    }

    #[test]
    fn test_scan_replacements_shift_later_matches() {
        let mut buffer = TextBuffer::new("a a a");
        let regex = Regex::new("a").unwrap();
        let mut starts = Vec::new();

        buffer
            .scan(&regex, |found| {
                starts.push(found.range.start);
                ScanAction::Replace("long".to_string())
            })
            .unwrap();

        assert_eq!(buffer.get_text(), "long long long");
        assert_eq!(starts, vec![pos(0, 0), pos(0, 5), pos(0, 10)]);
    }

    #[test]
    fn test_scan_stops_early() {
        let mut buffer = TextBuffer::new("x1 x2 x3");
        let regex = Regex::new(r"x(\d)").unwrap();
        let mut digits = Vec::new();

        let visited = buffer
            .scan(&regex, |found| {
                digits.push(found.captures[1].clone().unwrap());
                if digits.len() == 2 {
                    ScanAction::ReplaceAndStop("y".to_string())
                } else {
                    ScanAction::Continue
                }
            })
            .unwrap();

        assert_eq!(visited, 2);
        assert_eq!(digits, vec!["1", "2"]);
        assert_eq!(buffer.get_text(), "x1 y x3");
    }

    #[test]
    fn test_backwards_scan_in_range() {
        let mut buffer = TextBuffer::new("ab ab\nab ab");
        let regex = Regex::new("ab").unwrap();
        let mut seen = Vec::new();

        buffer
            .backwards_scan_in_range(
                &regex,
                Range::new(pos(0, 2), pos(1, 2)),
                |found| {
                    seen.push(found.range.start);
                    ScanAction::Replace("Z".to_string())
                },
            )
            .unwrap();

        assert_eq!(seen, vec![pos(1, 0), pos(0, 3)]);
        assert_eq!(buffer.get_text(), "ab Z\nZ ab");
    }

    #[test]
    fn test_multibyte_text_uses_character_columns() {
        let mut buffer = TextBuffer::new("héllo wörld");
        let regex = Regex::new("w.r").unwrap();
        let mut ranges = Vec::new();
        buffer
            .scan(&regex, |found| {
                ranges.push(found.range);
                ScanAction::Continue
            })
            .unwrap();
        assert_eq!(ranges, vec![Range::new(pos(0, 6), pos(0, 9))]);
    }

    #[test]
    fn test_replace_expands_groups_in_one_undo_step() {
        let mut buffer = TextBuffer::new("key=1\nother=22");
        let regex = Regex::new(r"(\w+)=(\d+)").unwrap();

        let count = buffer.replace(&regex, "$2:$1").unwrap();

        assert_eq!(count, 2);
        assert_eq!(buffer.get_text(), "1:key\n22:other");
        buffer.undo().unwrap();
        assert_eq!(buffer.get_text(), "key=1\nother=22");
    }

    #[test]
    fn test_replace_without_matches() {
        let mut buffer = TextBuffer::new("nothing here");
        let regex = Regex::new("absent").unwrap();
        assert_eq!(buffer.replace(&regex, "x").unwrap(), 0);
        assert!(!buffer.has_undo());
    }

    #[test]
    fn test_newline_replacement_in_crlf_text_keeps_later_matches_aligned() {
        let mut buffer = TextBuffer::new("x\r\nx x");
        let regex = Regex::new("x").unwrap();
        let mut starts = Vec::new();

        let visited = buffer
            .scan(&regex, |found| {
                starts.push(found.range.start);
                ScanAction::Replace("y\nz".to_string())
            })
            .unwrap();

        assert_eq!(visited, 3);
        assert_eq!(buffer.get_text(), "y\r\nz\r\ny\r\nz y\r\nz");
        assert_eq!(starts, vec![pos(0, 0), pos(2, 0), pos(3, 2)]);
    }

    #[test]
    fn test_match_inside_terminator_covers_whole_terminator() {
        let mut buffer = TextBuffer::new("ab\r\ncd");
        let regex = Regex::new("\r").unwrap();
        let mut ranges = Vec::new();

        buffer
            .scan(&regex, |found| {
                ranges.push(found.range);
                ScanAction::Replace(String::new())
            })
            .unwrap();

        assert_eq!(ranges, vec![Range::new(pos(0, 2), pos(1, 0))]);
        assert_eq!(buffer.get_text(), "ab\ncd");
    }

    #[test]
    fn test_replace_second_half_of_terminator() {
        let mut buffer = TextBuffer::new("ab\r\ncd\r\nef");
        let regex = Regex::new("\n").unwrap();

        assert_eq!(buffer.replace(&regex, "|").unwrap(), 2);
        assert_eq!(buffer.get_text(), "ab\r|cd\r|ef");
    }

    #[test]
    fn test_replace_pattern_reports_bad_patterns() {
        let mut buffer = TextBuffer::new("a1 b2");
        assert_eq!(buffer.replace_pattern(r"[a-z](\d)", "<$1>").unwrap(), 2);
        assert_eq!(buffer.get_text(), "<1> <2>");

        let result = buffer.replace_pattern("(unclosed", "x");
        assert!(matches!(result, Err(BufferError::Regex(_))));
        assert_eq!(buffer.get_text(), "<1> <2>");
    }
}
