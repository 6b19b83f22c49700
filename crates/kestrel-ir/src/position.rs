//! Source positions reported for thrown values

use std::fmt;

use serde::Serialize;

/// Position of a throw site in the original source.
///
/// `offset` is the byte offset of the start of the throwing statement or
/// call expression; `line` is 1-based and `column` 0-based, matching what an
/// unoptimized evaluation of the same source reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct SourcePosition {
    /// 1-based line number
    pub line: u32,
    /// 0-based column (bytes from line start)
    pub column: u32,
    /// Byte offset from the start of the source
    pub offset: u32,
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (offset {})", self.line, self.column, self.offset)
    }
}

/// Maps byte offsets to line/column pairs.
#[derive(Debug, Clone)]
pub struct LineIndex {
    line_starts: Vec<u32>,
    len: u32,
}

impl LineIndex {
    /// Build the index for `source`
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, byte) in source.bytes().enumerate() {
            if byte == b'\n' {
                line_starts.push(i as u32 + 1);
            }
        }
        Self {
            line_starts,
            len: source.len() as u32,
        }
    }

    /// Number of lines in the source
    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    /// Resolve a byte offset; offsets past the end clamp to the last byte.
    pub fn position(&self, offset: u32) -> SourcePosition {
        let offset = offset.min(self.len);
        let line = match self.line_starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next - 1,
        };
        SourcePosition {
            line: line as u32 + 1,
            column: offset - self.line_starts[line],
            offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_line() {
        let index = LineIndex::new("throw 1;");
        let pos = index.position(0);
        assert_eq!(pos.line, 1);
        assert_eq!(pos.column, 0);
    }

    #[test]
    fn test_offsets_across_lines() {
        let src = "(function(a, b) {        \n  if (a == 1) throw 1;   \n";
        let index = LineIndex::new(src);
        let throw_at = src.find("throw").unwrap() as u32;
        let pos = index.position(throw_at);
        assert_eq!(pos.line, 2);
        assert_eq!(pos.offset, 40);
        assert_eq!(pos.column, 14);
        assert_eq!(index.line_count(), 3);
    }

    #[test]
    fn test_offset_at_line_start() {
        let index = LineIndex::new("a\nb\nc");
        assert_eq!(index.position(2).line, 2);
        assert_eq!(index.position(4).line, 3);
        assert_eq!(index.position(99).offset, 5);
    }
}
