use serde::{Deserialize, Serialize};

use super::point::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineEnding {
    Unix,    // \n (LF)
    Windows, // \r\n (CRLF)
    Mac,     // \r (CR)
}

impl LineEnding {
    pub fn system_default() -> Self {
        if cfg!(windows) {
            LineEnding::Windows
        } else {
            LineEnding::Unix
        }
    }

    /// The first terminator found in `content`, if any.
    pub fn detect(content: &str) -> Option<Self> {
        split_lines(content)
            .into_iter()
            .find_map(|(_, ending)| LineEnding::from_terminator(ending))
    }

    pub fn from_terminator(ending: &str) -> Option<Self> {
        match ending {
            "\n" => Some(LineEnding::Unix),
            "\r\n" => Some(LineEnding::Windows),
            "\r" => Some(LineEnding::Mac),
            _ => None,
        }
    }

    /// Parses the `fileformat` names used by rc files.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "unix" => Some(LineEnding::Unix),
            "dos" | "windows" => Some(LineEnding::Windows),
            "mac" => Some(LineEnding::Mac),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LineEnding::Unix => "\n",
            LineEnding::Windows => "\r\n",
            LineEnding::Mac => "\r",
        }
    }
}

/// Splits text into `(line, terminator)` pairs. `\r\n`, `\n` and a lone `\r`
/// all terminate a line. The last pair always has an empty terminator, so the
/// result is never empty.
pub fn split_lines(text: &str) -> Vec<(&str, &str)> {
    let bytes = text.as_bytes();
    let mut lines = Vec::new();
    let mut line_start = 0;
    let mut index = 0;

    while index < bytes.len() {
        match bytes[index] {
            b'\n' => {
                lines.push((&text[line_start..index], &text[index..index + 1]));
                index += 1;
                line_start = index;
            }
            b'\r' => {
                let ending_len = if bytes.get(index + 1) == Some(&b'\n') { 2 } else { 1 };
                lines.push((
                    &text[line_start..index],
                    &text[index..index + ending_len],
                ));
                index += ending_len;
                line_start = index;
            }
            _ => index += 1,
        }
    }
    lines.push((&text[line_start..], ""));
    lines
}

/// The extent spanned by `text`: rows crossed and the column reached on the last row.
pub fn text_extent(text: &str) -> Position {
    let lines = split_lines(text);
    let rows = lines.len() - 1;
    let column = lines
        .last()
        .map(|(line, _)| line.chars().count())
        .unwrap_or(0);
    Position::new(rows, column)
}

pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Byte index of the character at `column`, clamped to the end of `line`.
pub fn byte_index(line: &str, column: usize) -> usize {
    line.char_indices()
        .nth(column)
        .map(|(index, _)| index)
        .unwrap_or(line.len())
}
