use std::cmp::min;
use std::time::{SystemTime, UNIX_EPOCH};

/// Marches over `[0, end_pos)` in steps of `interval`, yielding `(start, end)` of each chunk.
/// Used to stream the WRITE payload.
pub struct StreamCounter {
    pos: usize,
    end_pos: usize,
    interval: usize,
}

impl StreamCounter {
    pub fn new(end_pos: usize, interval: usize) -> Self {
        Self {
            pos: 0,
            end_pos,
            interval: interval.max(1),
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.end_pos - self.pos
    }
}

impl Iterator for StreamCounter {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<(usize, usize)> {
        if self.pos >= self.end_pos {
            return None;
        }
        let start = self.pos;
        self.pos = min(self.pos + self.interval, self.end_pos);
        Some((start, self.pos))
    }
}

/// Milliseconds since the unix epoch, 0 if the system clock is before it.
pub fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
