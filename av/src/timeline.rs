//! Ordered list of `(time, duration)` segments supporting `push`/`pop`, used
//! by probers to reassemble a contiguous time axis from samples that may
//! arrive with small timing gaps or overlaps.
//!
//! Grounded in `av/pktque/timeline.go`.

use std::collections::VecDeque;
use std::time::Duration;

struct Segment {
    time: Duration,
    dur: Duration,
}

pub struct Timeline {
    segs: VecDeque<Segment>,
    head_time: Duration,
}

impl Timeline {
    pub fn new() -> Self {
        Timeline { segs: VecDeque::new(), head_time: Duration::ZERO }
    }

    /// Appends a segment. Clamps `time` forward to `tail.time + tail.dur` if
    /// it would otherwise start before the previous segment ends (segments
    /// cannot overlap backwards).
    pub fn push(&mut self, mut time: Duration, dur: Duration) {
        if let Some(tail) = self.segs.back() {
            let tail_end = tail.time + tail.dur;
            if time < tail_end {
                time = tail_end;
            }
        }
        self.segs.push_back(Segment { time, dur });
    }

    /// Advances through up to `dur` total duration, returning the time at
    /// which the pop began (the head segment's time before any consumption,
    /// or the last known head time if the timeline is empty).
    pub fn pop(&mut self, mut dur: Duration) -> Duration {
        let first = match self.segs.front() {
            None => return self.head_time,
            Some(s) => s.time,
        };
        while dur > Duration::ZERO {
            let seg = match self.segs.front_mut() {
                None => break,
                Some(s) => s,
            };
            let consumed = dur.min(seg.dur);
            seg.dur -= consumed;
            dur -= consumed;
            seg.time += consumed;
            self.head_time += consumed;
            if seg.dur == Duration::ZERO {
                self.segs.pop_front();
            }
        }
        first
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_drains_single_segment() {
        let mut tl = Timeline::new();
        tl.push(Duration::from_millis(0), Duration::from_millis(20));
        assert_eq!(tl.pop(Duration::from_millis(20)), Duration::from_millis(0));
        assert_eq!(tl.pop(Duration::from_millis(1)), Duration::from_millis(20));
    }

    #[test]
    fn push_clamps_backward_overlap() {
        let mut tl = Timeline::new();
        tl.push(Duration::from_millis(0), Duration::from_millis(20));
        // would start at 10ms, inside the previous segment; clamp to 20ms.
        tl.push(Duration::from_millis(10), Duration::from_millis(40));
        assert_eq!(tl.pop(Duration::from_millis(20)), Duration::from_millis(0));
        assert_eq!(tl.pop(Duration::from_millis(40)), Duration::from_millis(20));
    }

    #[test]
    fn pop_partial_consumption_advances_within_segment() {
        let mut tl = Timeline::new();
        tl.push(Duration::from_millis(0), Duration::from_millis(40));
        assert_eq!(tl.pop(Duration::from_millis(10)), Duration::from_millis(0));
        // second pop starts mid-segment, at 10ms in.
        assert_eq!(tl.pop(Duration::from_millis(10)), Duration::from_millis(10));
    }
}
