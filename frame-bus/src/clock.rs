use std::time::{Duration, Instant};

/// One render tick: the frame timestamp and how many output frames it spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub timestamp: u64,
    pub count: u32,
}

/// Paces a render loop at a fixed interval. When the loop falls behind, the
/// next tick covers every missed interval so the producer can present one
/// frame `count` times instead of drifting.
#[derive(Debug)]
pub struct FrameClock {
    interval: u64,
    epoch: Instant,
    cur_time: u64,
    total_frames: u64,
    lagged_frames: u64,
}

impl FrameClock {
    pub fn new(interval_ns: u64) -> Self {
        Self {
            interval: interval_ns.max(1),
            epoch: Instant::now(),
            cur_time: 0,
            total_frames: 0,
            lagged_frames: 0,
        }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Nanoseconds since the clock was created.
    pub fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Advances the clock given the current time.
    pub fn tick(&mut self, now_ns: u64) -> Tick {
        let due = self.cur_time + self.interval;
        let count = if now_ns <= due {
            1
        } else {
            ((now_ns - self.cur_time) / self.interval).max(1)
        };

        self.cur_time += self.interval * count;
        self.total_frames += count;
        self.lagged_frames += count - 1;

        Tick {
            timestamp: self.cur_time,
            count: count as u32,
        }
    }

    /// Sleeps until the next interval is due, then ticks.
    pub fn wait_next(&mut self) -> Tick {
        let due = self.cur_time + self.interval;
        let now = self.now_ns();
        if now < due {
            std::thread::sleep(Duration::from_nanos(due - now));
        }
        let now = self.now_ns();
        self.tick(now)
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn lagged_frames(&self) -> u64 {
        self.lagged_frames
    }
}
