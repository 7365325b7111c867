use std::collections::VecDeque;

use crate::supervisor_support;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LogLine {
    pub seq: u64,
    pub text: String,
}

/// Bounded console history for one environment.
///
/// Sequence numbers start at 1 and keep counting through evictions and
/// `clear`, so a reader holding a cursor can tell when it fell behind.
#[derive(Debug)]
pub struct LogBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<LogLine>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(supervisor_support::log_max_lines())
    }
}

impl LogBuffer {
    pub fn with_capacity(max_lines: usize) -> Self {
        let max_lines = max_lines.max(1);
        Self {
            next_seq: 1,
            max_lines,
            lines: VecDeque::with_capacity(max_lines),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Sequence number the next appended line will get.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn append(&mut self, text: impl Into<String>) -> u64 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back(LogLine {
            seq,
            text: text.into(),
        });
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
        seq
    }

    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lines.iter().cloned().collect()
    }

    /// The most recent `limit` lines, oldest first.
    pub fn tail(&self, limit: usize) -> Vec<LogLine> {
        let start = self.lines.len().saturating_sub(limit);
        self.lines.iter().skip(start).cloned().collect()
    }

    /// Lines with a sequence number greater than `cursor`, at most `limit`.
    pub fn since(&self, cursor: u64, limit: usize) -> Vec<LogLine> {
        self.lines
            .iter()
            .filter(|l| l.seq > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_last_capacity_lines_in_order() {
        let mut buf = LogBuffer::with_capacity(3);
        for i in 1..=7 {
            buf.append(format!("line {i}"));
        }
        let snap = buf.snapshot();
        let texts: Vec<&str> = snap.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["line 5", "line 6", "line 7"]);
        // N=7, C=3: the oldest survivor is append #5.
        assert_eq!(snap[0].seq, 5);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn sequence_survives_clear() {
        let mut buf = LogBuffer::with_capacity(10);
        buf.append("a");
        buf.append("b");
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.append("c"), 3);
    }

    #[test]
    fn snapshot_is_detached_from_later_appends() {
        let mut buf = LogBuffer::with_capacity(10);
        buf.append("a");
        let snap = buf.snapshot();
        buf.append("b");
        assert_eq!(snap.len(), 1);
        assert_eq!(buf.snapshot().len(), 2);
    }

    #[test]
    fn tail_and_since() {
        let mut buf = LogBuffer::with_capacity(10);
        for i in 1..=5 {
            buf.append(format!("{i}"));
        }
        let tail: Vec<u64> = buf.tail(2).iter().map(|l| l.seq).collect();
        assert_eq!(tail, vec![4, 5]);
        let since: Vec<u64> = buf.since(2, 2).iter().map(|l| l.seq).collect();
        assert_eq!(since, vec![3, 4]);
        assert!(buf.since(5, 10).is_empty());
        assert_eq!(buf.tail(100).len(), 5);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let mut buf = LogBuffer::with_capacity(0);
        buf.append("x");
        buf.append("y");
        assert_eq!(buf.capacity(), 1);
        assert_eq!(buf.snapshot()[0].text, "y");
    }
}
