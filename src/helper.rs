//! Helper PLL.
//!
//! Disciplines the DMTD offset oscillator a small, fixed frequency offset
//! away from the reference so that every other loop sees a slow linear
//! phase ramp it can sample. The loop holds the tag interval of its
//! reference channel at exactly one span per sample by running the phase
//! setpoint forward at the nominal rate and regulating the difference to
//! zero.

use spll_dsp::{wrap_increment, Error, LockDetector, Pi};

use crate::hardware::{enable_tagger, SpllRegisters, Tag};
use crate::settings::HelperSettings;

/// Setpoint magnitude at which setpoint and adder are rebased to keep
/// the unwrapped values away from integer overflow.
const TAG_WRAPAROUND: i32 = 100_000_000;

/// DMTD offset oscillator loop.
#[derive(Debug)]
pub struct Helper {
    pi: Pi,
    ld: LockDetector,
    // phase units per reference period
    span: i32,
    error_clamp: i32,
    ref_channel: usize,
    p_adder: i32,
    p_setpoint: i32,
    tag_d: Option<i32>,
    samples: u32,
}

impl Helper {
    /// Build the loop around `ref_channel`, the global channel whose tags
    /// it consumes.
    pub fn new(
        cfg: &HelperSettings,
        span: i32,
        ref_channel: usize,
    ) -> Result<Self, Error> {
        Ok(Self {
            pi: cfg.gains.pi(),
            ld: cfg.window.detector()?,
            span,
            error_clamp: cfg.error_clamp,
            ref_channel,
            p_adder: 0,
            p_setpoint: 0,
            tag_d: None,
            samples: 0,
        })
    }

    /// Arm the loop and enable its tagger.
    ///
    /// The regulator is biased to the top clamp so acquisition always
    /// approaches from a positive frequency offset.
    pub fn start<R: SpllRegisters>(&mut self, regs: &mut R) {
        self.pi.bias = self.pi.y_max;
        self.pi.reset();
        self.ld.reset();
        self.p_adder = 0;
        self.p_setpoint = 0;
        self.tag_d = None;
        self.samples = 0;
        enable_tagger(regs, self.ref_channel, true);
    }

    /// Process one tag. Tags from other channels are ignored. The first
    /// matching tag seeds the setpoint without producing a DAC write.
    pub fn update<R: SpllRegisters>(&mut self, regs: &mut R, tag: Tag) {
        if tag.source != self.ref_channel {
            return;
        }
        let tag = tag.value;
        let Some(previous) = self.tag_d else {
            self.p_setpoint = tag;
            self.tag_d = Some(tag);
            return;
        };
        self.p_adder += wrap_increment(previous, tag, self.span);
        let err = (tag + self.p_adder - self.p_setpoint)
            .clamp(-self.error_clamp, self.error_clamp);
        if tag + self.p_adder > TAG_WRAPAROUND
            && self.p_setpoint > TAG_WRAPAROUND
        {
            self.p_adder -= TAG_WRAPAROUND;
            self.p_setpoint -= TAG_WRAPAROUND;
        }
        self.p_setpoint += self.span;
        self.tag_d = Some(tag);
        let y = self.pi.update(err);
        regs.write_helper_dac(y as u16);
        self.samples = self.samples.wrapping_add(1);
        self.ld.update(err);
    }

    pub fn locked(&self) -> bool {
        self.ld.locked()
    }

    /// Read and clear the lock transition flag.
    pub fn take_lock_change(&mut self) -> bool {
        self.ld.take_change()
    }

    /// Override the DAC, bypassing the regulator until the next update.
    pub fn force_dac<R: SpllRegisters>(&mut self, regs: &mut R, value: i32) {
        self.pi.set_y(value);
        regs.write_helper_dac(value as u16);
    }

    /// Most recent DAC output.
    pub fn y(&self) -> i32 {
        self.pi.y()
    }

    /// Most recent clamped phase error.
    pub fn error(&self) -> i32 {
        self.pi.x()
    }

    pub fn ref_channel(&self) -> usize {
        self.ref_channel
    }

    pub fn sample_count(&self) -> u32 {
        self.samples
    }
}
