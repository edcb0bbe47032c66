//! A coarse single-driver timing wheel.
//!
//! Resolution is whole seconds; the wheel spans `tick * buckets`
//! seconds, which is sized from the configured TIME-WAIT interval. The
//! driver task steps the wheel once per tick; callbacks run on that
//! task, so they must stay short (the socket-reuse callback just drops a
//! permit, which wakes the accept loop).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

type Callback = Box<dyn FnMut() + Send>;

struct Entry {
    once: bool,
    callback: Option<Callback>,
}

/// Opaque handle for [`TimingWheel::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken {
    bucket: u32,
    slot: u32,
}

pub struct TimingWheel {
    buckets: Mutex<Wheel>,
    tick_secs: u32,
    max_timeout_secs: u32,
}

struct Wheel {
    buckets: Vec<Vec<Entry>>,
    next_index: usize,
}

impl TimingWheel {
    #[must_use]
    pub fn new(tick_secs: u32, bucket_count: usize) -> Arc<Self> {
        let bucket_count = bucket_count.max(1);
        Arc::new(Self {
            buckets: Mutex::new(Wheel {
                buckets: (0..bucket_count).map(|_| Vec::new()).collect(),
                next_index: 0,
            }),
            tick_secs: tick_secs.max(1),
            max_timeout_secs: tick_secs.max(1) * bucket_count as u32,
        })
    }

    /// A wheel whose span covers `span_secs` at one-second resolution.
    #[must_use]
    pub fn spanning(span_secs: u32) -> Arc<Self> {
        Self::new(1, span_secs.max(1) as usize + 1)
    }

    #[must_use]
    pub fn max_timeout_secs(&self) -> u32 {
        self.max_timeout_secs
    }

    /// Schedules `callback` roughly `timeout_secs` from now.
    ///
    /// `once` callbacks fire a single time; recurring ones fire on every
    /// wheel revolution until removed.
    pub fn add<F>(&self, timeout_secs: u32, once: bool, callback: F) -> TimerToken
    where
        F: FnMut() + Send + 'static,
    {
        let timeout = timeout_secs.min(self.max_timeout_secs);
        let mut wheel = self.buckets.lock();
        let bucket_count = wheel.buckets.len();
        let bucket = (wheel.next_index + (timeout / self.tick_secs) as usize) % bucket_count;
        let chain = &mut wheel.buckets[bucket];
        let slot = chain.len() as u32;
        chain.push(Entry {
            once,
            callback: Some(Box::new(callback)),
        });
        TimerToken {
            bucket: bucket as u32,
            slot,
        }
    }

    /// Cancels a scheduled callback. Already-fired `once` callbacks are
    /// a no-op.
    pub fn remove(&self, token: TimerToken) {
        let mut wheel = self.buckets.lock();
        if let Some(entry) = wheel
            .buckets
            .get_mut(token.bucket as usize)
            .and_then(|chain| chain.get_mut(token.slot as usize))
        {
            entry.callback = None;
        }
    }

    /// Advances the wheel one step, running the due bucket.
    pub fn tick(&self) {
        // Take the due chain out so callbacks run without the wheel lock
        // held (a callback may re-arm onto this same wheel).
        let mut due = {
            let mut wheel = self.buckets.lock();
            let index = wheel.next_index;
            wheel.next_index = (index + 1) % wheel.buckets.len();
            std::mem::take(&mut wheel.buckets[index])
        };

        let mut keep = Vec::new();
        for mut entry in due.drain(..) {
            if let Some(cb) = entry.callback.as_mut() {
                cb();
                if !entry.once {
                    keep.push(entry);
                }
            }
        }

        if !keep.is_empty() {
            let mut wheel = self.buckets.lock();
            let index = if wheel.next_index == 0 {
                wheel.buckets.len() - 1
            } else {
                wheel.next_index - 1
            };
            wheel.buckets[index].extend(keep);
        }
    }

    /// Spawns the driver task stepping the wheel once per tick until the
    /// returned handle is aborted or the runtime shuts down.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let wheel = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(wheel.tick_secs as u64));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                wheel.tick();
            }
        })
    }
}

impl std::fmt::Debug for TimingWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimingWheel")
            .field("tick_secs", &self.tick_secs)
            .field("max_timeout_secs", &self.max_timeout_secs)
            .finish()
    }
}
