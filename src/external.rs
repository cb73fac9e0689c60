//! External reference alignment.
//!
//! Grandmaster mode disciplines the node to an external 10 MHz input.
//! The input is conditioned by a hardware PLL onto a tag channel, a
//! dedicated main loop locks the primary output to that channel, and the
//! aligner then bit-bangs the output phase until the local PPS edge sits
//! on an edge of the external clock. The whole procedure runs as a state
//! machine advanced once per foreground tick; a vanished input clock
//! drops it back to waiting for the input.

use num_enum::IntoPrimitive;
use spll_dsp::{time_after, Error};

use crate::convert::PhaseScale;
use crate::hardware::{SpllRegisters, Tag};
use crate::mpll::Mpll;
use crate::settings::{ExternalSettings, MainSettings};

/// Alignment progress, advanced by [`ExternalAligner::step`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum AlignState {
    /// Aligner not running.
    Off,
    /// Waiting for a clock on the external input.
    WaitClockIn,
    /// Waiting for the input conditioning PLL to lock.
    WaitPllLock,
    /// Input conditioned, waiting for the helper.
    Start,
    /// Starting the dedicated main loop.
    StartMain,
    /// Main loop locked, requesting a PPS counter sync.
    InitCsync,
    /// Waiting for the counter sync to complete.
    WaitCsync,
    /// Arming the PPS edge sampler.
    StartAlignment,
    /// Stepping the phase until the sampled level drops.
    WaitSample,
    /// Slewing out the fixed sampling path delay.
    CompensateDelay,
    /// Aligned and locked.
    Locked,
}

/// PPS alignment to the external reference.
#[derive(Debug)]
pub struct ExternalAligner {
    mpll: Mpll,
    realign: bool,
    settle_ticks: u32,
    // search geometry in shifter units
    align_step: i32,
    period: i32,
    compensation: i32,
    state: AlignState,
    deadline: u32,
    shift: i32,
}

impl ExternalAligner {
    /// Build the aligner locking global channel `id_out` to the
    /// conditioned external channel `id_ref`. With `align_pps` clear the
    /// counter sync and the PPS edge search are skipped and the chain
    /// reports lock on frequency lock alone.
    pub fn new(
        cfg: &ExternalSettings,
        main: &MainSettings,
        scale: &PhaseScale,
        id_ref: usize,
        id_out: usize,
        n_chan_ref: usize,
        align_pps: bool,
    ) -> Result<Self, Error> {
        Ok(Self {
            mpll: Mpll::new(main, scale.span(), id_ref, id_out, n_chan_ref)?,
            realign: align_pps,
            settle_ticks: cfg.settle_ticks,
            align_step: scale.shift_from_picos(cfg.align_step_ps),
            period: scale.shift_from_picos(cfg.period_ps),
            compensation: scale.shift_from_picos(cfg.compensation_ps),
            state: AlignState::Off,
            deadline: 0,
            shift: 0,
        })
    }

    /// Enable the external input and begin waiting for a clock. On
    /// hardware without the input circuitry the aligner stays off.
    pub fn start<R: SpllRegisters>(&mut self, regs: &mut R) {
        if !regs.external_status().supported {
            log::warn!("no external reference input, aligner stays off");
            self.state = AlignState::Off;
            return;
        }
        regs.external_enable(true);
        self.shift = 0;
        self.state = AlignState::WaitClockIn;
    }

    /// Stop the aligner and release the external input.
    pub fn stop<R: SpllRegisters>(&mut self, regs: &mut R) {
        self.mpll.stop(regs);
        regs.external_enable(false);
        self.state = AlignState::Off;
    }

    /// Feed one tag to the dedicated main loop.
    pub fn update<R: SpllRegisters>(&mut self, regs: &mut R, tag: Tag) {
        if self.state != AlignState::Off {
            self.mpll.update(regs, tag);
        }
    }

    /// Advance the state machine by at most one transition.
    pub fn step<R: SpllRegisters>(
        &mut self,
        regs: &mut R,
        helper_locked: bool,
    ) {
        let status = regs.external_status();
        if self.state == AlignState::Off {
            return;
        }
        if !status.clock_present && self.state != AlignState::WaitClockIn {
            self.mpll.stop(regs);
            self.state = AlignState::WaitClockIn;
            return;
        }
        match self.state {
            AlignState::Off => {}
            AlignState::WaitClockIn => {
                if status.clock_present {
                    self.state = AlignState::WaitPllLock;
                }
            }
            AlignState::WaitPllLock => {
                if status.pll_locked {
                    self.state = AlignState::Start;
                }
            }
            AlignState::Start => {
                if helper_locked {
                    self.state = AlignState::StartMain;
                }
            }
            AlignState::StartMain => {
                self.mpll.start(regs);
                self.state = AlignState::InitCsync;
            }
            AlignState::InitCsync => {
                if self.mpll.locked() {
                    if !self.realign {
                        self.state = AlignState::Locked;
                        return;
                    }
                    regs.request_pps_sync();
                    self.deadline =
                        regs.ticks().wrapping_add(self.settle_ticks);
                    self.state = AlignState::WaitCsync;
                }
            }
            AlignState::WaitCsync => {
                if regs.pps_in_sync() {
                    self.state = AlignState::StartAlignment;
                } else if time_after(regs.ticks(), self.deadline) {
                    // request got lost, issue a fresh one
                    self.state = AlignState::InitCsync;
                }
            }
            AlignState::StartAlignment => {
                self.shift = 0;
                self.mpll.set_phase_shift(0);
                // a level latched before the search began is stale
                let _ = regs.align_sample();
                self.state = AlignState::WaitSample;
            }
            AlignState::WaitSample => {
                if self.mpll.shifter_busy() {
                    return;
                }
                let Some(level) = regs.align_sample() else {
                    return;
                };
                if level {
                    self.shift += self.align_step;
                    if self.shift >= self.period {
                        self.shift -= self.period;
                    }
                    self.mpll.set_phase_shift(self.shift);
                } else {
                    // edge found, slew out the sampling path delay
                    self.mpll.set_phase_shift(self.shift + self.compensation);
                    self.state = AlignState::CompensateDelay;
                }
            }
            AlignState::CompensateDelay => {
                if !self.mpll.shifter_busy() {
                    self.state = AlignState::Locked;
                }
            }
            AlignState::Locked => {}
        }
    }

    /// The PPS is aligned and the whole external chain reports lock.
    pub fn locked<R: SpllRegisters>(&self, regs: &R) -> bool {
        let status = regs.external_status();
        self.state == AlignState::Locked
            && self.mpll.locked()
            && status.clock_present
            && status.pll_locked
    }

    /// The input clock is present and conditioned.
    pub fn conditioned(&self) -> bool {
        !matches!(
            self.state,
            AlignState::Off
                | AlignState::WaitClockIn
                | AlignState::WaitPllLock
        )
    }

    pub fn state(&self) -> AlignState {
        self.state
    }

    /// Most recent DAC output of the dedicated main loop.
    pub fn y(&self) -> i32 {
        self.mpll.y()
    }
}
