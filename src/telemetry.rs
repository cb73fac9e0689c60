//! SoftPLL diagnostics.
//!
//! Raw counters and DAC values accumulate in [`TelemetryBuffer`] while
//! the loops run; [`TelemetryBuffer::finalize`] turns them into a
//! serializable [`Stats`] snapshot on demand, so the interrupt path never
//! pays for serialization. A host detects a snapshot torn by a concurrent
//! update through the sequence number and rereads. The optional tag ring
//! keeps the most recently dispatched tags for offline loop analysis.

use heapless::Deque;
use serde::Serialize;
use spll_dsp::Lowpass;

use crate::hardware::Tag;

/// Tag ring capacity.
pub const TAG_RING_DEPTH: usize = 128;

// reported DAC values settle over a few hundred foreground ticks
const DAC_SMOOTHING_ALPHA: i32 = 4000;

/// One dispatched tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TagRecord {
    /// Capture channel.
    pub source: usize,
    /// Captured counter value.
    pub value: i32,
    /// Dispatch position since the ring was enabled.
    pub index: u32,
}

/// Ring of the most recently dispatched tags.
///
/// Disabled by default; recording costs a copy per tag in interrupt
/// context.
#[derive(Debug, Default)]
pub struct TagRing {
    enabled: bool,
    index: u32,
    ring: Deque<TagRecord, TAG_RING_DEPTH>,
}

impl TagRing {
    /// Gate recording. Disabling clears the ring.
    pub fn enable(&mut self, enable: bool) {
        self.enabled = enable;
        if !enable {
            self.index = 0;
            self.ring.clear();
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Record one tag, displacing the oldest entry when full.
    pub fn record(&mut self, tag: Tag) {
        if !self.enabled {
            return;
        }
        if self.ring.is_full() {
            self.ring.pop_front();
        }
        self.ring
            .push_back(TagRecord {
                source: tag.source,
                value: tag.value,
                index: self.index,
            })
            .ok();
        self.index = self.index.wrapping_add(1);
    }

    /// Recorded tags, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &TagRecord> {
        self.ring.iter()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

/// Live diagnostic state updated while the SoftPLL runs.
#[derive(Debug)]
pub struct TelemetryBuffer {
    /// Snapshot sequence number, bumped once per foreground tick.
    pub sequence: u32,
    /// Sequencer restarts caused by lost lock.
    pub delock_count: u32,
    /// Interrupt invocations.
    pub irq_count: u32,
    /// SoftPLL initializations.
    pub start_count: u32,
    helper_y: Lowpass,
    main_y: Lowpass,
    helper_y_smoothed: i32,
    main_y_smoothed: i32,
}

impl Default for TelemetryBuffer {
    fn default() -> Self {
        Self {
            sequence: 0,
            delock_count: 0,
            irq_count: 0,
            start_count: 0,
            helper_y: Lowpass::new(DAC_SMOOTHING_ALPHA),
            main_y: Lowpass::new(DAC_SMOOTHING_ALPHA),
            helper_y_smoothed: 0,
            main_y_smoothed: 0,
        }
    }
}

impl TelemetryBuffer {
    /// Advance the sequence number and fold the DAC outputs into the
    /// smoothed readings.
    pub fn tick(&mut self, helper_y: i32, main_y: i32) {
        self.sequence = self.sequence.wrapping_add(1);
        self.helper_y_smoothed = self.helper_y.update(helper_y);
        self.main_y_smoothed = self.main_y.update(main_y);
    }

    /// Finalized snapshot for host export.
    pub fn finalize(
        &self,
        mode: u8,
        seq_state: u8,
        align_state: u8,
        helper_locked: bool,
        main_locked: bool,
    ) -> Stats {
        Stats {
            sequence: self.sequence,
            mode,
            seq_state,
            align_state,
            helper_locked,
            main_locked,
            helper_y: self.helper_y_smoothed,
            main_y: self.main_y_smoothed,
            delock_count: self.delock_count,
            irq_count: self.irq_count,
            start_count: self.start_count,
        }
    }
}

/// Diagnostic snapshot exported to the host.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Snapshot sequence number. Rereads on mismatch catch tearing.
    pub sequence: u32,
    /// Operating mode.
    pub mode: u8,
    /// Sequencer state.
    pub seq_state: u8,
    /// External alignment state.
    pub align_state: u8,
    /// Helper loop lock.
    pub helper_locked: bool,
    /// Main loop lock.
    pub main_locked: bool,
    /// Smoothed helper DAC output.
    pub helper_y: i32,
    /// Smoothed main DAC output.
    pub main_y: i32,
    /// Sequencer restarts caused by lost lock.
    pub delock_count: u32,
    /// Interrupt invocations.
    pub irq_count: u32,
    /// SoftPLL initializations.
    pub start_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_ring_records_nothing() {
        let mut ring = TagRing::default();
        ring.record(Tag { source: 0, value: 1 });
        assert!(ring.is_empty());
        ring.enable(true);
        ring.record(Tag { source: 0, value: 1 });
        assert_eq!(ring.len(), 1);
        ring.enable(false);
        assert!(ring.is_empty());
    }

    #[test]
    fn ring_keeps_the_newest_tags() {
        let mut ring = TagRing::default();
        ring.enable(true);
        for value in 0..2 * TAG_RING_DEPTH as i32 {
            ring.record(Tag { source: 3, value });
        }
        assert_eq!(ring.len(), TAG_RING_DEPTH);
        let first = ring.iter().next().unwrap();
        assert_eq!(first.value, TAG_RING_DEPTH as i32);
        assert_eq!(first.index, TAG_RING_DEPTH as u32);
        let last = ring.iter().last().unwrap();
        assert_eq!(last.value, 2 * TAG_RING_DEPTH as i32 - 1);
    }

    #[test]
    fn snapshot_carries_the_counters() {
        let mut buffer = TelemetryBuffer::default();
        buffer.delock_count = 3;
        buffer.irq_count = 1000;
        buffer.start_count = 1;
        for _ in 0..5 {
            buffer.tick(40000, 30000);
        }
        let stats = buffer.finalize(3, 8, 0, true, true);
        assert_eq!(stats.sequence, 5);
        assert_eq!(stats.delock_count, 3);
        assert_eq!(stats.irq_count, 1000);
        assert_eq!(stats.start_count, 1);
        // the filter seeds on the first sample, a constant stays put
        assert_eq!(stats.helper_y, 40000);
        assert_eq!(stats.main_y, 30000);
        assert!(stats.helper_locked);
    }

    #[test]
    fn snapshot_serializes() {
        let stats = TelemetryBuffer::default().finalize(1, 9, 0, false, false);
        let mut buf = [0u8; 512];
        assert!(serde_json_core::to_slice(&stats, &mut buf).is_ok());
    }
}
