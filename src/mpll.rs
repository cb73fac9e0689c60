//! Main PLL.
//!
//! Locks one output oscillator to a reference channel by comparing their
//! DMTD tags. The two sides deliver tags in either order; an update
//! computes only once both sides have produced one since the last sample.
//! A slew limited phase setpoint biases the reference side to move the
//! output phase in controlled steps.
//!
//! The same loop serves the primary channel and every aux channel, each
//! instance driving its own DAC through the selector.

use spll_dsp::{wrap_increment, Error, LockDetector, Pi};

use crate::hardware::{enable_tagger, SpllRegisters, Tag};
use crate::settings::MainSettings;

/// Adder magnitude at which both sides are rebased to keep the unwrapped
/// values away from integer overflow.
const TAG_WRAPAROUND: i32 = 100_000_000;

/// Fold a phase error into one tag span around zero.
///
/// While locked the two sides sit within a fraction of a period of each
/// other, but a phase shift crossing a full period makes one side's wrap
/// adder tick before the other, showing up as a sudden full-span jump in
/// the raw error. Discarding everything above the span hides those jumps.
/// Tag sequence numbers would make this exact.
fn fold_phase_error(err: i32, span: i32) -> i32 {
    let mut err = err & (span - 1);
    if err & (span >> 1) != 0 {
        err |= !(span - 1);
    }
    err
}

/// DMTD phase lock of one output channel against a reference channel.
#[derive(Debug)]
pub struct Mpll {
    pi: Pi,
    ld: LockDetector,
    enabled: bool,
    // phase units per reference period
    span: i32,
    shifter_speed: u32,
    id_ref: usize,
    id_out: usize,
    // output channels count from zero at the DAC selector
    dac_index: usize,
    tag_ref: Option<i32>,
    tag_out: Option<i32>,
    tag_ref_d: Option<i32>,
    tag_out_d: Option<i32>,
    adder_ref: i32,
    adder_out: i32,
    phase_shift_target: i32,
    phase_shift_current: i32,
    shift_div: u32,
    samples: u32,
}

impl Mpll {
    /// Build a loop locking global channel `id_out` to global channel
    /// `id_ref`. Output channels start at `n_chan_ref`.
    pub fn new(
        cfg: &MainSettings,
        span: i32,
        id_ref: usize,
        id_out: usize,
        n_chan_ref: usize,
    ) -> Result<Self, Error> {
        Ok(Self {
            pi: cfg.gains.pi(),
            ld: cfg.window.detector()?,
            enabled: false,
            span,
            shifter_speed: cfg.shifter_speed,
            id_ref,
            id_out,
            dac_index: id_out - n_chan_ref,
            tag_ref: None,
            tag_out: None,
            tag_ref_d: None,
            tag_out_d: None,
            adder_ref: 0,
            adder_out: 0,
            phase_shift_target: 0,
            phase_shift_current: 0,
            shift_div: 0,
            samples: 0,
        })
    }

    /// Arm the loop and enable the taggers on both of its channels.
    pub fn start<R: SpllRegisters>(&mut self, regs: &mut R) {
        self.enabled = true;
        self.pi.reset();
        self.ld.reset();
        self.tag_ref = None;
        self.tag_out = None;
        self.tag_ref_d = None;
        self.tag_out_d = None;
        self.adder_ref = 0;
        self.adder_out = 0;
        self.phase_shift_target = 0;
        self.phase_shift_current = 0;
        self.shift_div = 0;
        self.samples = 0;
        enable_tagger(regs, self.id_ref, true);
        enable_tagger(regs, self.id_out, true);
    }

    /// Stop the loop. Releases the output tagger only; the reference
    /// tagger stays on for its other consumers. A stopped loop ignores
    /// tags so stale state cannot reach the DAC.
    pub fn stop<R: SpllRegisters>(&mut self, regs: &mut R) {
        self.enabled = false;
        enable_tagger(regs, self.id_out, false);
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Process one tag. Tags from unrelated channels are ignored.
    pub fn update<R: SpllRegisters>(&mut self, regs: &mut R, tag: Tag) {
        if !self.enabled {
            return;
        }
        if tag.source == self.id_ref {
            self.tag_ref = Some(tag.value);
        }
        if tag.source == self.id_out {
            self.tag_out = Some(tag.value);
        }
        let (Some(tag_ref), Some(tag_out)) = (self.tag_ref, self.tag_out)
        else {
            return;
        };
        if let Some(d) = self.tag_ref_d {
            self.adder_ref += wrap_increment(d, tag_ref, self.span);
        }
        if let Some(d) = self.tag_out_d {
            self.adder_out += wrap_increment(d, tag_out, self.span);
        }
        let mut err = self.adder_ref + tag_ref - self.adder_out - tag_out;
        if self.adder_ref > 2 * TAG_WRAPAROUND
            && self.adder_out > 2 * TAG_WRAPAROUND
        {
            self.adder_ref -= TAG_WRAPAROUND;
            self.adder_out -= TAG_WRAPAROUND;
        }
        if self.ld.locked() {
            err = fold_phase_error(err, self.span);
        }
        let y = self.pi.update(err);
        regs.write_main_dac(self.dac_index, y as u16);
        self.tag_ref_d = Some(tag_ref);
        self.tag_out_d = Some(tag_out);
        self.tag_ref = None;
        self.tag_out = None;
        self.step_shifter();
        self.samples = self.samples.wrapping_add(1);
        self.ld.update(err);
    }

    // One slew step toward the phase target per `shifter_speed` samples.
    // The reference adder moves with the setpoint so the loop chases the
    // shifted phase instead of seeing it as a disturbance.
    fn step_shifter(&mut self) {
        if self.phase_shift_current < self.phase_shift_target {
            if self.shift_div == self.shifter_speed - 1 {
                self.phase_shift_current += 1;
                self.adder_ref += 1;
                self.shift_div = 0;
            } else {
                self.shift_div += 1;
            }
        } else if self.phase_shift_current > self.phase_shift_target {
            if self.shift_div == self.shifter_speed - 1 {
                self.phase_shift_current -= 1;
                self.adder_ref -= 1;
                self.shift_div = 0;
            } else {
                self.shift_div += 1;
            }
        }
    }

    /// Set a new phase shift target in phase units. Supersedes any shift
    /// still in progress; the slew divider restarts so the first step
    /// comes a full interval after the call.
    pub fn set_phase_shift(&mut self, target: i32) {
        self.shift_div = 0;
        self.phase_shift_target = target;
    }

    /// Current and target phase shift in phase units.
    pub fn phase_shift(&self) -> (i32, i32) {
        (self.phase_shift_current, self.phase_shift_target)
    }

    /// A commanded phase shift has not finished slewing yet.
    pub fn shifter_busy(&self) -> bool {
        self.phase_shift_target != self.phase_shift_current
    }

    pub fn locked(&self) -> bool {
        self.ld.locked()
    }

    /// Most recent DAC output.
    pub fn y(&self) -> i32 {
        self.pi.y()
    }

    /// Most recent phase error.
    pub fn error(&self) -> i32 {
        self.pi.x()
    }

    /// Override the DAC, bypassing the regulator until the next update.
    pub fn force_dac<R: SpllRegisters>(&mut self, regs: &mut R, value: i32) {
        self.pi.set_y(value);
        regs.write_main_dac(self.dac_index, value as u16);
    }

    /// Midscale DAC value used while clearing the loop output.
    pub fn dac_midscale(&self) -> i32 {
        (self.pi.y_max + self.pi.y_min) / 2
    }

    pub fn id_ref(&self) -> usize {
        self.id_ref
    }

    pub fn id_out(&self) -> usize {
        self.id_out
    }

    pub fn dac_index(&self) -> usize {
        self.dac_index
    }

    pub fn sample_count(&self) -> u32 {
        self.samples
    }
}
