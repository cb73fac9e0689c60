//! Phase trackers.
//!
//! Continuously measure the phase offset between each reference channel
//! and the local output channel for the timing servo. Tags from the local
//! channel act as the sentinel timestamp shared by the whole bank; every
//! enabled tracker folds the difference to its own channel's tags into an
//! `n_avg` sample average.

use heapless::Vec;

use crate::hardware::{Tag, MAX_CHAN_REF};

#[derive(Copy, Clone, Debug, Default)]
struct Tracker {
    enabled: bool,
    acc: i32,
    avg_count: u32,
    preserve_sign: usize,
    phase: i32,
    ready: bool,
}

/// Bank of per reference channel phase trackers.
#[derive(Debug)]
pub struct PtrackerBank {
    trackers: Vec<Tracker, MAX_CHAN_REF>,
    // global channel id delivering the sentinel tags
    sentinel: usize,
    tag_ref: Option<i32>,
    bits: u32,
    n_avg: u32,
}

impl PtrackerBank {
    /// Build trackers for `n_channels` reference channels, timestamped by
    /// the global `sentinel` channel.
    pub fn new(
        n_channels: usize,
        sentinel: usize,
        bits: u32,
        n_avg: u32,
    ) -> Self {
        let mut trackers = Vec::new();
        trackers.resize_default(n_channels.min(MAX_CHAN_REF)).ok();
        Self {
            trackers,
            sentinel,
            tag_ref: None,
            bits,
            n_avg,
        }
    }

    /// Arm one tracker. Clears any published value.
    pub fn start(&mut self, channel: usize) {
        if let Some(s) = self.trackers.get_mut(channel) {
            *s = Tracker {
                enabled: true,
                ..Tracker::default()
            };
        }
    }

    /// Re-arm every enabled tracker, discarding partial windows.
    pub fn restart(&mut self) {
        for s in self.trackers.iter_mut().filter(|s| s.enabled) {
            *s = Tracker {
                enabled: true,
                ..Tracker::default()
            };
        }
    }

    pub fn stop(&mut self, channel: usize) {
        if let Some(s) = self.trackers.get_mut(channel) {
            s.enabled = false;
        }
    }

    pub fn enabled(&self, channel: usize) -> bool {
        self.trackers.get(channel).is_some_and(|s| s.enabled)
    }

    /// Process one tag. Sentinel tags refresh the shared timestamp, any
    /// other tag feeds the tracker of its channel.
    pub fn update(&mut self, tag: Tag) {
        if tag.source == self.sentinel {
            self.tag_ref = Some(tag.value);
            return;
        }
        let Some(tag_ref) = self.tag_ref else {
            return;
        };
        let Some(s) = self.trackers.get_mut(tag.source) else {
            return;
        };
        if !s.enabled {
            return;
        }
        let span = 1i32 << self.bits;
        let delta = (tag_ref - tag.value) & (span - 1);
        let index = (delta >> (self.bits - 2)) as usize;
        if s.avg_count == 0 {
            // The two MSBs of the window's first delta pick the quadrant
            // that later samples unwrap against, a LUT instead of sign
            // branches.
            s.preserve_sign = index << 2;
            s.acc = delta;
            s.avg_count = 1;
        } else {
            let adj =
                [0, 0, 0, -span, 0, 0, 0, 0, 0, 0, 0, 0, span, 0, 0, 0];
            s.acc += delta + adj[index + s.preserve_sign];
            s.avg_count += 1;
            if s.avg_count == self.n_avg {
                s.phase = s.acc / self.n_avg as i32;
                s.ready = true;
                s.acc = 0;
                s.avg_count = 0;
            }
        }
    }

    /// Latest published average in phase units and the ready flag. The
    /// flag latches once the first window completes and clears on
    /// [`Self::start`].
    pub fn read(&self, channel: usize) -> Option<(i32, bool)> {
        self.trackers.get(channel).map(|s| (s.phase, s.ready))
    }
}
