//! Bounded window of recent lines for multi-line matching.

use std::collections::VecDeque;

/// Default window: the current line only.
pub const DEFAULT_MAX_LINES: usize = 1;

/// A line kept in the window.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedLine {
    /// Text seen by the regexes (date removed).
    pub text: String,
    /// Line as read from the source.
    pub line: String,
    pub time: f64,
}

#[derive(Debug)]
pub struct LineBuffer {
    lines: VecDeque<BufferedLine>,
    max_lines: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}

impl LineBuffer {
    pub fn new(max_lines: usize) -> Self {
        let max_lines = max_lines.max(1);
        Self {
            lines: VecDeque::with_capacity(max_lines),
            max_lines,
        }
    }

    pub fn max_lines(&self) -> usize {
        self.max_lines
    }

    /// Resize the window, dropping the oldest lines if it shrinks.
    pub fn set_max_lines(&mut self, max_lines: usize) {
        self.max_lines = max_lines.max(1);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&mut self, line: BufferedLine) {
        if self.lines.len() == self.max_lines {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Drop the newest line.
    pub fn pop_last(&mut self) -> Option<BufferedLine> {
        self.lines.pop_back()
    }

    pub fn remove(&mut self, index: usize) -> Option<BufferedLine> {
        self.lines.remove(index)
    }

    pub fn last(&self) -> Option<&BufferedLine> {
        self.lines.back()
    }

    pub fn get(&self, index: usize) -> Option<&BufferedLine> {
        self.lines.get(index)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(n: usize) -> BufferedLine {
        BufferedLine {
            text: format!("t{n}"),
            line: format!("l{n}"),
            time: n as f64,
        }
    }

    #[test]
    fn test_bounded_window() {
        let mut buf = LineBuffer::new(3);
        for i in 0..5 {
            buf.push(line(i));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.get(0).unwrap().text, "t2");
        assert_eq!(buf.last().unwrap().text, "t4");

        buf.set_max_lines(1);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.last().unwrap().text, "t4");
    }

    #[test]
    fn test_zero_is_one() {
        let mut buf = LineBuffer::new(0);
        buf.push(line(1));
        buf.push(line(2));
        assert_eq!(buf.max_lines(), 1);
        assert_eq!(buf.pop_last().unwrap().time, 2.0);
        assert!(buf.is_empty());
    }
}
