//! Time sources for the scheduler.
//!
//! Every timestamp is a [`Duration`] measured from an arbitrary origin chosen
//! by the host (usually the instant the application started). Nothing in this
//! module reads the system clock, so tests can drive it with exact values.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    time::Duration,
};

use crate::{BeatVizError, BpmValue, Result};

/// Frame rate the render `delta` is normalised against.
pub const REFERENCE_FPS: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum ClockRate {
    /// Fires whenever the host renders a frame.
    Host,
    /// Fires at a fixed number of ticks per second.
    Fixed(f64),
}

/// Delivered by a render clock once per frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderTick {
    pub at: Duration,
    /// Wall time since the previous frame.
    pub elapsed: Duration,
    /// `elapsed` expressed in frames at [`REFERENCE_FPS`].
    pub delta: f64,
}

impl RenderTick {
    /// Builds a tick from a frame-normalised delta, mostly useful in tests.
    pub fn from_delta(at: Duration, delta: f64) -> Self {
        Self {
            at,
            elapsed: Duration::from_secs_f64((delta / REFERENCE_FPS).max(0.0)),
            delta,
        }
    }
}

/// Delivered by a fixed-rate clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTick {
    /// Instant the tick was due, which may be earlier than the poll.
    pub at: Duration,
    /// Zero-based tick number since the clock was started.
    pub index: u64,
    /// Overdue ticks that were folded into this one.
    pub missed: u64,
}

/// Something that fires repeatedly at a configured rate.
///
/// A clock never shares its rate with another clock. Fixed-rate clocks compute
/// tick `n` as `anchor + n / rate` rather than summing periods, so they do not
/// drift over long runtimes.
#[derive(Debug, Clone)]
pub struct Clock {
    rate: ClockRate,
    running: bool,
    anchor: Duration,
    /// Ticks delivered since `anchor`.
    fired: u64,
    /// Ticks delivered before the last re-anchor.
    base_index: u64,
    last_tick: Option<Duration>,
}

impl Clock {
    /// A clock driven by the host's frame loop.
    pub fn render() -> Self {
        Self::with_rate(ClockRate::Host)
    }

    /// A clock firing `ticks_per_second` times a second.
    pub fn fixed(ticks_per_second: f64) -> Result<Self> {
        Ok(Self::with_rate(ClockRate::Fixed(check_rate(ticks_per_second)?)))
    }

    /// A clock firing once per beat.
    pub fn beat(bpm: BpmValue) -> Self {
        Self::with_rate(ClockRate::Fixed(bpm.ticks_per_second()))
    }

    fn with_rate(rate: ClockRate) -> Self {
        Self {
            rate,
            running: false,
            anchor: Duration::ZERO,
            fired: 0,
            base_index: 0,
            last_tick: None,
        }
    }

    /// Ticks per second, or `None` for a render clock.
    pub fn rate(&self) -> Option<f64> {
        match self.rate {
            ClockRate::Host => None,
            ClockRate::Fixed(rate) => Some(rate),
        }
    }

    pub fn period(&self) -> Option<Duration> {
        self.rate()
            .map(|rate| Duration::from_nanos((1e9 / rate).round() as u64))
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Starts the clock. The first fixed-rate tick is due at `now`. Calling
    /// this on a running clock has no effect.
    pub fn start(&mut self, now: Duration) {
        if self.running {
            return;
        }
        self.running = true;
        self.anchor = now;
        self.fired = 0;
        self.base_index = 0;
        self.last_tick = None;
    }

    /// Halts delivery. Nothing is returned by `poll` or `tick` afterwards.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Changes the rate of a fixed-rate clock. The next tick lands one new
    /// period after the last delivered tick.
    pub fn set_rate(&mut self, ticks_per_second: f64) -> Result<()> {
        if self.rate == ClockRate::Host {
            return Err(BeatVizError::msg(
                "the render clock follows the host refresh rate",
            ));
        }
        let rate = check_rate(ticks_per_second)?;
        if self.running {
            if let Some(last) = self.last_tick {
                // The tick at the new anchor has already been delivered.
                self.base_index += self.fired - 1;
                self.anchor = last;
                self.fired = 1;
            }
        }
        self.rate = ClockRate::Fixed(rate);
        Ok(())
    }

    /// Instant of the next tick of a running fixed-rate clock.
    pub fn next_due(&self) -> Option<Duration> {
        match self.rate {
            ClockRate::Fixed(rate) if self.running => Some(self.due_at(self.fired, rate)),
            _ => None,
        }
    }

    /// Delivers the latest tick due at or before `now`. Older overdue ticks are
    /// reported through [`ClockTick::missed`] instead of being replayed.
    pub fn poll(&mut self, now: Duration) -> Option<ClockTick> {
        let rate = self.running_rate()?;
        let latest = self.latest_due(now, rate)?;

        let tick = ClockTick {
            at: self.due_at(latest, rate),
            index: self.base_index + latest,
            missed: latest - self.fired,
        };
        self.fired = latest + 1;
        self.last_tick = Some(tick.at);
        Some(tick)
    }

    /// Instant of the tick [`poll`](Self::poll) would deliver at `now`,
    /// without delivering it.
    pub fn peek(&self, now: Duration) -> Option<Duration> {
        let rate = self.running_rate()?;
        self.latest_due(now, rate)
            .map(|index| self.due_at(index, rate))
    }

    fn running_rate(&self) -> Option<f64> {
        match self.rate {
            ClockRate::Fixed(rate) if self.running => Some(rate),
            _ => None,
        }
    }

    /// Index of the latest undelivered tick due at or before `now`.
    fn latest_due(&self, now: Duration, rate: f64) -> Option<u64> {
        if self.due_at(self.fired, rate) > now {
            return None;
        }
        let since_anchor = now.saturating_sub(self.anchor).as_secs_f64();
        let mut latest = (since_anchor * rate).floor() as u64;
        // Guard against rounding either way at exact boundaries.
        while latest > self.fired && self.due_at(latest, rate) > now {
            latest -= 1;
        }
        while self.due_at(latest + 1, rate) <= now {
            latest += 1;
        }
        Some(latest.max(self.fired))
    }

    /// Advances a render clock to `now`, returning the frame it represents.
    pub fn tick(&mut self, now: Duration) -> Option<RenderTick> {
        if !self.running || self.rate != ClockRate::Host {
            return None;
        }
        let previous = self.last_tick.unwrap_or(now);
        let elapsed = now.saturating_sub(previous);
        self.last_tick = Some(now);
        self.fired += 1;
        Some(RenderTick {
            at: now,
            elapsed,
            delta: elapsed.as_secs_f64() * REFERENCE_FPS,
        })
    }

    /// Rounded to the nanosecond so whole-millisecond periods land exactly.
    fn due_at(&self, index: u64, rate: f64) -> Duration {
        let nanos = (index as f64 * 1e9 / rate).round();
        self.anchor + Duration::from_nanos(nanos as u64)
    }
}

fn check_rate(ticks_per_second: f64) -> Result<f64> {
    if ticks_per_second.is_finite() && ticks_per_second > 0.0 {
        Ok(ticks_per_second)
    } else {
        Err(BeatVizError::msg(format!(
            "clock rate must be positive, got {ticks_per_second}"
        )))
    }
}

/// Identifies an armed timer so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// One-shot timers keyed by deadline.
///
/// Timers with equal deadlines fire in the order they were armed. Cancelled
/// entries are dropped lazily when they reach the front of the queue.
#[derive(Debug)]
pub struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<(Duration, TimerHandle)>>,
    pending: HashMap<TimerHandle, T>,
    next_id: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, deadline: Duration, payload: T) -> TimerHandle {
        let handle = TimerHandle(self.next_id);
        self.next_id += 1;
        self.heap.push(Reverse((deadline, handle)));
        self.pending.insert(handle, payload);
        handle
    }

    /// Returns `true` if the timer was still pending.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.pending.remove(&handle).is_some()
    }

    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.pending.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn next_deadline(&mut self) -> Option<Duration> {
        self.discard_cancelled();
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Removes and returns the earliest timer whose deadline is at or before
    /// `now`.
    pub fn pop_due(&mut self, now: Duration) -> Option<(Duration, TimerHandle, T)> {
        self.discard_cancelled();
        let Reverse((deadline, handle)) = *self.heap.peek()?;
        if deadline > now {
            return None;
        }
        self.heap.pop();
        let payload = self.pending.remove(&handle)?;
        Some((deadline, handle, payload))
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.pending.clear();
    }

    fn discard_cancelled(&mut self) {
        while let Some(Reverse((_, handle))) = self.heap.peek() {
            if self.pending.contains_key(handle) {
                break;
            }
            self.heap.pop();
        }
    }
}
