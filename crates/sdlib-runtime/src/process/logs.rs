//! Per-port ring buffers for captured engine output.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Default lines retained per port.
const DEFAULT_CAPACITY: usize = 500;

/// Bounded in-memory log storage keyed by engine port.
pub struct LogRing {
    inner: Mutex<HashMap<u16, VecDeque<String>>>,
    capacity: usize,
}

impl LogRing {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Append a line, evicting the oldest once the buffer is full.
    pub fn add_line(&self, port: u16, line: &str) {
        let mut inner = self.inner.lock().expect("log ring poisoned");
        let buffer = inner.entry(port).or_default();
        if buffer.len() == self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(line.to_string());
    }

    /// Snapshot of the retained lines for a port, oldest first.
    pub fn lines(&self, port: u16) -> Vec<String> {
        self.inner
            .lock()
            .expect("log ring poisoned")
            .get(&port)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the buffer for a port.
    pub fn clear(&self, port: u16) {
        self.inner.lock().expect("log ring poisoned").remove(&port);
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retains_at_most_capacity_lines() {
        let ring = LogRing::with_capacity(3);
        for i in 0..5 {
            ring.add_line(8001, &format!("line {i}"));
        }
        assert_eq!(ring.lines(8001), vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn ports_are_independent() {
        let ring = LogRing::new();
        ring.add_line(8001, "a");
        ring.add_line(8002, "b");
        assert_eq!(ring.lines(8001), vec!["a"]);
        assert_eq!(ring.lines(8002), vec!["b"]);

        ring.clear(8001);
        assert!(ring.lines(8001).is_empty());
        assert_eq!(ring.lines(8002), vec!["b"]);
    }
}
