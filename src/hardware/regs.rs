//! Register word layouts of the phase detection core.
//!
//! These are the raw formats crossing the [`super::SpllRegisters`] seam.
//! A memory mapped backend reads and writes them verbatim; the simulated
//! backend stores them as its register file.

use arbitrary_int::{u24, u4, u7};
use bitbybit::bitfield;
use serde::{Deserialize, Serialize};

/// Tag readout word, one FIFO entry.
#[bitfield(u32, default = 0)]
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct TagReadout {
    /// Captured counter value.
    #[bits(0..=23, rw)]
    pub value: u24,
    /// Capture channel the tag belongs to.
    #[bits(24..=30, rw)]
    pub chan_id: u7,
}

/// Main DAC write word. One register serves all output oscillators
/// through the selector field.
#[bitfield(u32, default = 0)]
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct DacMain {
    #[bits(0..=15, rw)]
    pub value: u16,
    #[bits(16..=19, rw)]
    pub dac_sel: u4,
}

/// Output channel control: per-channel enable and lock indication
/// consumed by the timestamping unit and diagnostics.
#[bitfield(u32, default = 0)]
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Occr {
    #[bits(0..=7, rw)]
    pub out_en: u8,
    #[bits(8..=15, rw)]
    pub out_lock: u8,
}

/// External clock control.
#[bitfield(u32, default = 0)]
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Eccr {
    /// Enable the external reference input.
    #[bit(0, rw)]
    pub ext_en: bool,
    /// Enable the PPS edge alignment sampler.
    #[bit(1, rw)]
    pub align_en: bool,
    /// The input circuitry is present on this board.
    #[bit(2, rw)]
    pub ext_supported: bool,
}

/// External clock status.
#[bitfield(u32, default = 0)]
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtStatus {
    /// A clock is present on the external input.
    #[bit(0, rw)]
    pub clock_present: bool,
    /// The input conditioning PLL is locked.
    #[bit(1, rw)]
    pub pll_locked: bool,
    /// The alignment sampler holds a fresh sample.
    #[bit(2, rw)]
    pub sample_valid: bool,
    /// Level of the external clock at the last PPS edge.
    #[bit(3, rw)]
    pub sample_level: bool,
}

/// PPS generator sync control.
#[bitfield(u32, default = 0)]
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct PpsCr {
    /// Counter sync to the external reference requested.
    #[bit(0, rw)]
    pub sync: bool,
    /// Counter sync completed.
    #[bit(1, rw)]
    pub in_sync: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trip() {
        let w = TagReadout::default()
            .with_value(u24::new(16399))
            .with_chan_id(u7::new(6));
        assert_eq!(w.raw_value() & 0xff_ffff, 16399);
        let r = TagReadout::new_with_raw_value(w.raw_value());
        assert_eq!(r.value().value(), 16399);
        assert_eq!(r.chan_id().value(), 6);
    }

    #[test]
    fn dac_select() {
        let w = DacMain::default()
            .with_value(65530)
            .with_dac_sel(u4::new(3));
        assert_eq!(w.raw_value(), (3 << 16) | 65530);
    }
}
