//! SoftPLL core.
//!
//! Owns every control loop and sequences them from cold start to lock.
//! The interrupt path drains the tag FIFO and feeds the running loops;
//! the foreground tick advances the sequencer and the per channel state
//! machines and refreshes the diagnostics. The host facing API talks
//! picoseconds and channel numbers.
//!
//! The sequencer also runs once per foreground tick because in
//! grandmaster mode no tags flow between enabling the external input
//! and the aligner starting its loop, so a purely tag driven sequencer
//! would stall there.

use heapless::Vec;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use spll_dsp::time_after;

use crate::external::{AlignState, ExternalAligner};
use crate::hardware::{
    enable_tagger, SpllRegisters, Tag, MAX_CHAN_OUT, MAX_CHAN_REF,
    TICKS_PER_SECOND,
};
use crate::helper::Helper;
use crate::mpll::Mpll;
use crate::ptracker::PtrackerBank;
use crate::settings::Settings;
use crate::telemetry::{Stats, TagRing, TelemetryBuffer};
use crate::Error;

/// Operating mode, fixed at [`SoftPll::init`].
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum Mode {
    /// Disciplined to the external 10 MHz reference.
    GrandMaster = 1,
    /// Local oscillator free running, helper locked for phase readout.
    FreeRunningMaster = 2,
    /// Disciplined to one uplink reference channel.
    Slave = 3,
    /// All loops idle.
    Disabled = 4,
}

/// Bring-up sequencer state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum SeqState {
    /// Starting the external input conditioning.
    StartExt = 1,
    /// Waiting for the external input to condition.
    WaitExt = 2,
    /// Starting the helper loop.
    StartHelper = 3,
    /// Waiting for the helper to lock.
    WaitHelper = 4,
    /// Starting the main loop.
    StartMain = 5,
    /// Waiting for the main loop to lock.
    WaitMain = 6,
    /// Sequencer parked.
    Disabled = 7,
    /// All loops of the mode locked.
    Ready = 8,
    /// Forcing the DACs to their acquisition values.
    ClearDacs = 9,
    /// Letting the oscillators settle on the forced DACs.
    WaitClearDacs = 10,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum AuxState {
    Disabled,
    LockPll,
    AlignPhase,
    Ready,
}

#[derive(Debug)]
struct AuxChannel {
    state: AuxState,
    pll: Mpll,
}

/// Host visible state of one aux output channel.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct AuxStatus {
    /// The channel's loop is running.
    pub enabled: bool,
    /// The channel is locked and phase aligned to the primary output.
    pub locked: bool,
}

/// One phase tracker measurement.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct PtrackerReading {
    /// Phase of the reference channel against the local output,
    /// picoseconds within one reference period.
    pub phase_ps: i64,
    /// The tracker is armed.
    pub enabled: bool,
    /// At least one averaging window has completed since arming.
    pub ready: bool,
}

/// The complete SoftPLL.
///
/// [`Self::on_interrupt`] services the tag capture interrupt,
/// [`Self::update`] runs from the foreground loop at
/// [`TICKS_PER_SECOND`]. Everything else is host API.
#[derive(Debug)]
pub struct SoftPll {
    settings: Settings,
    mode: Mode,
    seq_state: SeqState,
    ref_channel: usize,
    align_pps: bool,
    n_chan_ref: usize,
    n_chan_out: usize,
    dac_deadline: u32,
    // last commanded shift, new aux channels align to it
    shift_ps: i64,
    helper: Helper,
    mpll: Mpll,
    external: Option<ExternalAligner>,
    aux: Vec<AuxChannel, MAX_CHAN_OUT>,
    ptrackers: PtrackerBank,
    ptracker_mask: u32,
    telemetry: TelemetryBuffer,
    tag_ring: TagRing,
}

impl SoftPll {
    /// Build and initialize the SoftPLL.
    ///
    /// Args:
    /// * `regs`: Register access, queried for the channel complement.
    /// * `settings`: Loop tuning.
    /// * `mode`: Operating mode.
    /// * `ref_channel`: Reference channel disciplining a slave. Ignored
    ///   in the other modes.
    /// * `align_pps`: Realign the PPS edge to the external reference in
    ///   grandmaster mode. Ignored in the other modes.
    pub fn new<R: SpllRegisters>(
        regs: &mut R,
        settings: Settings,
        mode: Mode,
        ref_channel: usize,
        align_pps: bool,
    ) -> Result<Self, Error> {
        let scale = settings.scale;
        let n_ref = regs.n_chan_ref().min(MAX_CHAN_REF);
        let mut pll = Self {
            helper: Helper::new(&settings.helper, scale.span(), n_ref)?,
            mpll: Mpll::new(&settings.main, scale.span(), 0, n_ref, n_ref)?,
            external: None,
            aux: Vec::new(),
            ptrackers: PtrackerBank::new(
                n_ref,
                n_ref,
                scale.tag_bits,
                settings.ptracker_average_samples,
            ),
            settings,
            mode: Mode::Disabled,
            seq_state: SeqState::Disabled,
            ref_channel: 0,
            align_pps: false,
            n_chan_ref: n_ref,
            n_chan_out: regs.n_chan_out().min(MAX_CHAN_OUT),
            dac_deadline: 0,
            shift_ps: 0,
            ptracker_mask: 0,
            telemetry: TelemetryBuffer::default(),
            tag_ring: TagRing::default(),
        };
        pll.init(regs, mode, ref_channel, align_pps)?;
        Ok(pll)
    }

    /// Reinitialize into `mode`, rebuilding every loop.
    ///
    /// The phase tracker enable mask survives so the timing servo keeps
    /// its measurement channels across a mode switch. The start counter
    /// advances, the delock counter clears.
    pub fn init<R: SpllRegisters>(
        &mut self,
        regs: &mut R,
        mode: Mode,
        ref_channel: usize,
        align_pps: bool,
    ) -> Result<(), Error> {
        let n_ref = regs.n_chan_ref().min(MAX_CHAN_REF);
        let n_out = regs.n_chan_out().min(MAX_CHAN_OUT);
        if mode == Mode::Slave && ref_channel >= n_ref {
            return Err(Error::Channel(ref_channel));
        }
        let scale = self.settings.scale;
        let span = scale.span();
        // master modes tune the helper to the local output instead of an
        // uplink
        let helper_ref = if mode == Mode::Slave { ref_channel } else { n_ref };
        self.helper = Helper::new(&self.settings.helper, span, helper_ref)?;
        self.mpll =
            Mpll::new(&self.settings.main, span, ref_channel, n_ref, n_ref)?;
        self.aux.clear();
        for ch in 1..n_out {
            self.aux
                .push(AuxChannel {
                    state: AuxState::Disabled,
                    pll: Mpll::new(
                        &self.settings.main,
                        span,
                        ref_channel,
                        n_ref + ch,
                        n_ref,
                    )?,
                })
                .ok();
        }
        self.external = None;
        if mode == Mode::GrandMaster {
            if regs.external_status().supported {
                self.external = Some(ExternalAligner::new(
                    &self.settings.external,
                    &self.settings.main,
                    &scale,
                    n_ref + n_out,
                    n_ref,
                    n_ref,
                    align_pps,
                )?);
            } else {
                log::warn!(
                    "no external reference input, grandmaster stays disabled"
                );
            }
        }
        self.ptrackers = PtrackerBank::new(
            n_ref,
            n_ref,
            scale.tag_bits,
            self.settings.ptracker_average_samples,
        );
        let start_count = self.telemetry.start_count.wrapping_add(1);
        self.telemetry = TelemetryBuffer::default();
        self.telemetry.start_count = start_count;
        self.mode = mode;
        self.ref_channel = ref_channel;
        self.align_pps = align_pps;
        self.n_chan_ref = n_ref;
        self.n_chan_out = n_out;
        self.shift_ps = 0;

        regs.write_helper_dac(0);
        for ch in 0..n_out {
            regs.write_main_dac(ch, 0);
            regs.enable_out_tagger(ch, false);
            regs.set_channel_locked(ch, false);
        }
        for ch in 0..n_ref {
            regs.enable_ref_tagger(ch, false);
        }
        regs.external_enable(false);
        regs.set_deglitch_threshold(self.settings.deglitch_threshold);
        while regs.read_tag().is_some() {}
        self.seq_state = if mode == Mode::Disabled
            || (mode == Mode::GrandMaster && self.external.is_none())
        {
            SeqState::Disabled
        } else {
            // the interrupt needs a tag stream before any loop runs
            regs.enable_out_tagger(0, true);
            SeqState::ClearDacs
        };
        log::info!(
            "spll init: mode {:?}, {} reference and {} output channels",
            mode,
            n_ref,
            n_out
        );
        Ok(())
    }

    /// Service the tag capture interrupt. Drains the FIFO, dispatching
    /// each tag through the sequencer and into the running loops.
    pub fn on_interrupt<R: SpllRegisters>(&mut self, regs: &mut R) {
        while let Some(tag) = regs.read_tag() {
            self.tag_ring.record(tag);
            self.sequence(regs);
            self.update_loops(regs, tag);
        }
        self.telemetry.irq_count = self.telemetry.irq_count.wrapping_add(1);
        regs.clear_interrupt();
    }

    /// Foreground tick at [`TICKS_PER_SECOND`].
    pub fn update<R: SpllRegisters>(&mut self, regs: &mut R) {
        self.sequence(regs);
        let helper_locked = self.helper.locked();
        if let Some(ext) = &mut self.external {
            ext.step(regs, helper_locked);
        }
        self.update_aux(regs);
        self.telemetry.tick(self.helper.y(), self.main_y());
    }

    fn sequence<R: SpllRegisters>(&mut self, regs: &mut R) {
        match self.seq_state {
            SeqState::ClearDacs => {
                self.helper
                    .force_dac(regs, self.settings.helper.gains.y_max);
                self.mpll.force_dac(regs, self.mpll.dac_midscale());
                enable_tagger(regs, self.n_chan_ref, true);
                self.dac_deadline =
                    regs.ticks().wrapping_add(TICKS_PER_SECOND / 20);
                self.seq_state = SeqState::WaitClearDacs;
            }
            SeqState::WaitClearDacs => {
                if time_after(regs.ticks(), self.dac_deadline) {
                    self.seq_state = if self.mode == Mode::GrandMaster {
                        SeqState::StartExt
                    } else {
                        SeqState::StartHelper
                    };
                }
            }
            SeqState::StartExt => {
                enable_tagger(regs, self.n_chan_ref, false);
                if let Some(ext) = &mut self.external {
                    ext.start(regs);
                }
                self.seq_state = SeqState::WaitExt;
            }
            SeqState::WaitExt => {
                if self.external.as_ref().is_some_and(|e| e.conditioned()) {
                    self.seq_state = SeqState::StartHelper;
                }
            }
            SeqState::StartHelper => {
                self.helper.start(regs);
                self.seq_state = SeqState::WaitHelper;
            }
            SeqState::WaitHelper => {
                if self.helper.locked() && self.helper.take_lock_change() {
                    if self.mode == Mode::Slave {
                        self.seq_state = SeqState::StartMain;
                    } else {
                        self.start_ptrackers(regs);
                        self.seq_state = SeqState::Ready;
                        log::info!("spll ready");
                    }
                }
            }
            SeqState::StartMain => {
                self.mpll.start(regs);
                self.seq_state = SeqState::WaitMain;
            }
            SeqState::WaitMain => {
                if self.mpll.locked() {
                    self.start_ptrackers(regs);
                    self.seq_state = SeqState::Ready;
                    log::info!("spll ready");
                }
            }
            SeqState::Ready => {
                if !self.helper.locked() {
                    self.delock(SeqState::ClearDacs);
                } else if self.mode == Mode::GrandMaster
                    && !self.external.as_ref().is_some_and(|e| e.conditioned())
                {
                    self.delock(SeqState::StartExt);
                } else if self.mode == Mode::Slave && !self.mpll.locked() {
                    self.delock(SeqState::ClearDacs);
                }
            }
            SeqState::Disabled => {}
        }
    }

    fn delock(&mut self, next: SeqState) {
        self.telemetry.delock_count =
            self.telemetry.delock_count.wrapping_add(1);
        self.seq_state = next;
        log::warn!("spll delocked, resuming at {:?}", next);
    }

    fn update_loops<R: SpllRegisters>(&mut self, regs: &mut R, tag: Tag) {
        if matches!(
            self.seq_state,
            SeqState::WaitExt
                | SeqState::StartHelper
                | SeqState::WaitHelper
                | SeqState::StartMain
                | SeqState::WaitMain
                | SeqState::Ready
        ) {
            if let Some(ext) = &mut self.external {
                ext.update(regs, tag);
            }
        }
        if matches!(
            self.seq_state,
            SeqState::WaitHelper
                | SeqState::StartMain
                | SeqState::WaitMain
                | SeqState::Ready
        ) {
            self.helper.update(regs, tag);
        }
        match self.seq_state {
            SeqState::WaitMain => self.mpll.update(regs, tag),
            SeqState::Ready => {
                if self.mode == Mode::Slave {
                    self.mpll.update(regs, tag);
                }
                for aux in self.aux.iter_mut() {
                    aux.pll.update(regs, tag);
                }
            }
            _ => {}
        }
        // reference channels plus the primary output, the bank's sentinel
        if tag.source <= self.n_chan_ref {
            self.ptrackers.update(tag);
        }
    }

    fn start_ptrackers<R: SpllRegisters>(&mut self, regs: &mut R) {
        for channel in 0..self.n_chan_ref {
            if self.ptracker_mask & (1 << channel) != 0 {
                enable_tagger(regs, channel, true);
                self.ptrackers.start(channel);
            }
        }
    }

    fn update_aux<R: SpllRegisters>(&mut self, regs: &mut R) {
        let ready =
            self.seq_state == SeqState::Ready && self.mpll.locked();
        let shift = self.settings.scale.shift_from_picos(self.shift_ps);
        for (index, aux) in self.aux.iter_mut().enumerate() {
            let channel = index + 1;
            let requested = regs.channel_enable_requested(channel);
            if aux.state != AuxState::Disabled && !(requested && ready) {
                aux.pll.stop(regs);
                regs.set_channel_locked(channel, false);
                aux.state = AuxState::Disabled;
                log::info!("aux channel {} disabled", channel);
                continue;
            }
            match aux.state {
                AuxState::Disabled => {
                    if requested && ready {
                        aux.pll.start(regs);
                        aux.state = AuxState::LockPll;
                        log::info!("aux channel {} locking", channel);
                    }
                }
                AuxState::LockPll => {
                    if aux.pll.locked() {
                        // align to the shift the primary channel carries
                        aux.pll.set_phase_shift(shift);
                        aux.state = AuxState::AlignPhase;
                    }
                }
                AuxState::AlignPhase => {
                    if !aux.pll.shifter_busy() {
                        regs.set_channel_locked(channel, true);
                        aux.state = AuxState::Ready;
                        log::info!("aux channel {} locked", channel);
                    }
                }
                AuxState::Ready => {
                    if !aux.pll.locked() {
                        aux.pll.stop(regs);
                        regs.set_channel_locked(channel, false);
                        aux.state = AuxState::Disabled;
                        log::warn!("aux channel {} delocked", channel);
                    }
                }
            }
        }
    }

    // In grandmaster mode DAC 0 belongs to the aligner's loop.
    fn main_y(&self) -> i32 {
        self.external.as_ref().map_or(self.mpll.y(), |e| e.y())
    }

    fn out_pll(&self, channel: usize) -> Result<&Mpll, Error> {
        if channel == 0 {
            Ok(&self.mpll)
        } else {
            self.aux
                .get(channel - 1)
                .map(|a| &a.pll)
                .ok_or(Error::Channel(channel))
        }
    }

    fn out_pll_mut(&mut self, channel: usize) -> Result<&mut Mpll, Error> {
        if channel == 0 {
            Ok(&mut self.mpll)
        } else {
            self.aux
                .get_mut(channel - 1)
                .map(|a| &mut a.pll)
                .ok_or(Error::Channel(channel))
        }
    }

    /// Lock state of an output channel. Channel 0, the primary output,
    /// is locked once the sequencer is ready; an aux channel additionally
    /// needs its own loop locked.
    pub fn check_lock(&self, channel: usize) -> Result<bool, Error> {
        let ready = self.seq_state == SeqState::Ready;
        if channel == 0 {
            return Ok(ready);
        }
        let aux = self
            .aux
            .get(channel - 1)
            .ok_or(Error::Channel(channel))?;
        Ok(ready && aux.pll.locked())
    }

    /// Command a phase shift on one output channel.
    ///
    /// The value is remembered and newly enabled aux channels align to
    /// it.
    pub fn set_phase_shift(
        &mut self,
        channel: usize,
        ps: i64,
    ) -> Result<(), Error> {
        self.shift_ps = ps;
        let units = self.settings.scale.shift_from_picos(ps);
        self.out_pll_mut(channel)?.set_phase_shift(units);
        Ok(())
    }

    /// Command the same phase shift on the primary output and every
    /// ready aux channel.
    pub fn set_phase_shift_all(&mut self, ps: i64) {
        self.shift_ps = ps;
        let units = self.settings.scale.shift_from_picos(ps);
        self.mpll.set_phase_shift(units);
        for aux in self
            .aux
            .iter_mut()
            .filter(|a| a.state == AuxState::Ready)
        {
            aux.pll.set_phase_shift(units);
        }
    }

    /// Current and target phase shift of an output channel in
    /// picoseconds.
    pub fn phase_shift(&self, channel: usize) -> Result<(i64, i64), Error> {
        let (current, target) = self.out_pll(channel)?.phase_shift();
        let scale = &self.settings.scale;
        Ok((scale.shift_to_picos(current), scale.shift_to_picos(target)))
    }

    /// A phase shift on the channel is still slewing.
    pub fn shifter_busy(&self, channel: usize) -> Result<bool, Error> {
        Ok(self.out_pll(channel)?.shifter_busy())
    }

    /// Gate continuous phase measurement of a reference channel.
    ///
    /// The enable survives [`Self::init`]; the tracker rearms when the
    /// sequencer reaches ready.
    pub fn enable_ptracker<R: SpllRegisters>(
        &mut self,
        regs: &mut R,
        channel: usize,
        enable: bool,
    ) -> Result<(), Error> {
        if channel >= self.n_chan_ref {
            return Err(Error::Channel(channel));
        }
        if enable {
            self.ptracker_mask |= 1 << channel;
            enable_tagger(regs, channel, true);
            self.ptrackers.start(channel);
        } else {
            self.ptracker_mask &= !(1 << channel);
            self.ptrackers.stop(channel);
            if channel != self.mpll.id_ref() {
                enable_tagger(regs, channel, false);
            }
        }
        Ok(())
    }

    /// Latest measurement of a reference channel's tracker. The phase is
    /// normalized into one reference period; with divided DMTD clocks
    /// the doubled phase folds back into the period.
    pub fn read_ptracker(
        &self,
        channel: usize,
    ) -> Result<PtrackerReading, Error> {
        let (phase, ready) = self
            .ptrackers
            .read(channel)
            .ok_or(Error::Channel(channel))?;
        let scale = &self.settings.scale;
        let span = scale.span();
        let mut phase = phase % span;
        if phase < 0 {
            phase += span;
        }
        let units = (phase * scale.divider()) & (span - 1);
        Ok(PtrackerReading {
            phase_ps: scale.to_picos(units as i64),
            enabled: self.ptracker_mask & (1 << channel) != 0,
            ready,
        })
    }

    /// State of an aux output channel.
    pub fn aux_status(&self, channel: usize) -> Result<AuxStatus, Error> {
        let aux = self
            .aux
            .get(channel.wrapping_sub(1))
            .ok_or(Error::Channel(channel))?;
        Ok(AuxStatus {
            enabled: aux.state != AuxState::Disabled,
            locked: aux.state == AuxState::Ready,
        })
    }

    /// Last regulator output behind a DAC selector index. Negative
    /// selects the helper DAC, zero the primary output DAC, positive the
    /// aux channel DACs.
    pub fn dac(&self, index: i32) -> Result<i32, Error> {
        if index < 0 {
            Ok(self.helper.y())
        } else if index == 0 {
            Ok(self.main_y())
        } else {
            Ok(self.out_pll(index as usize)?.y())
        }
    }

    /// Override a DAC, bypassing its regulator until the next loop
    /// update. Debug facility.
    pub fn set_dac<R: SpllRegisters>(
        &mut self,
        regs: &mut R,
        index: i32,
        value: i32,
    ) -> Result<(), Error> {
        if index < 0 {
            self.helper.force_dac(regs, value);
        } else {
            self.out_pll_mut(index as usize)?.force_dac(regs, value);
        }
        Ok(())
    }

    /// The external alignment chain reports full lock.
    pub fn external_locked<R: SpllRegisters>(&self, regs: &R) -> bool {
        self.helper.locked()
            && self.external.as_ref().is_some_and(|e| e.locked(regs))
    }

    /// Diagnostic snapshot.
    pub fn stats<R: SpllRegisters>(&self, regs: &R) -> Stats {
        let align_state = self
            .external
            .as_ref()
            .map_or(AlignState::Off, |e| e.state());
        let main_locked = match &self.external {
            Some(ext) => ext.locked(regs),
            None => self.mpll.locked(),
        };
        self.telemetry.finalize(
            self.mode.into(),
            self.seq_state.into(),
            align_state.into(),
            self.helper.locked(),
            main_locked,
        )
    }

    /// Gate the diagnostic tag ring.
    pub fn enable_tag_log(&mut self, enable: bool) {
        self.tag_ring.enable(enable);
    }

    /// Recently dispatched tags.
    pub fn tag_log(&self) -> &TagRing {
        &self.tag_ring
    }

    /// Park the sequencer and release every tagger and the external
    /// input.
    pub fn shutdown<R: SpllRegisters>(&mut self, regs: &mut R) {
        if let Some(ext) = &mut self.external {
            ext.stop(regs);
        }
        for channel in 0..self.n_chan_ref {
            regs.enable_ref_tagger(channel, false);
        }
        for channel in 0..self.n_chan_out {
            regs.enable_out_tagger(channel, false);
        }
        self.seq_state = SeqState::Disabled;
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn seq_state(&self) -> SeqState {
        self.seq_state
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Apply new settings and reinitialize in the current mode.
    pub fn reconfigure<R: SpllRegisters>(
        &mut self,
        regs: &mut R,
        settings: Settings,
    ) -> Result<(), Error> {
        self.settings = settings;
        self.init(regs, self.mode, self.ref_channel, self.align_pps)
    }
}

/// Read the PPS generator time. The seconds register is read on both
/// sides of the cycle counter to catch a rollover in between.
pub fn pps_time<R: SpllRegisters>(regs: &R) -> (u32, u32) {
    loop {
        let seconds = regs.pps_seconds();
        let cycles = regs.pps_cycles();
        if regs.pps_seconds() == seconds {
            return (seconds, cycles);
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::hardware::sim::SimRegisters;
    use crate::telemetry::TagRecord;

    const SPAN: i32 = 1 << 14;

    fn quick() -> Settings {
        let mut s = Settings::default();
        s.helper.window.lock_samples = 8;
        s.helper.window.delock_samples = 2;
        s.main.window.lock_samples = 8;
        s.main.window.delock_samples = 2;
        s.main.shifter_speed = 2;
        s.ptracker_average_samples = 4;
        s
    }

    fn slave(sim: &mut SimRegisters) -> SoftPll {
        SoftPll::new(sim, quick(), Mode::Slave, 0, false).unwrap()
    }

    // A tag stream in lock: every channel advances one span per round
    // with one unit of jitter.
    fn run(
        pll: &mut SoftPll,
        sim: &mut SimRegisters,
        channels: &[usize],
        from: i32,
        rounds: i32,
    ) {
        for n in from..from + rounds {
            let value = SPAN * (n - 1) + (n & 1);
            for &ch in channels {
                sim.push_tag(ch, value);
            }
            pll.on_interrupt(sim);
            sim.advance(7);
            pll.update(sim);
        }
    }

    // Like `run`, but with random bounded jitter shared by all channels.
    fn run_jittered(
        pll: &mut SoftPll,
        sim: &mut SimRegisters,
        rng: &mut StdRng,
        channels: &[usize],
        from: i32,
        rounds: i32,
    ) {
        for n in from..from + rounds {
            let value = SPAN * (n - 1) + rng.gen_range(-1..=1);
            for &ch in channels {
                sim.push_tag(ch, value);
            }
            pll.on_interrupt(sim);
            sim.advance(7);
            pll.update(sim);
        }
    }

    #[test]
    fn slave_sequences_to_ready() {
        let mut sim = SimRegisters::new(2, 2);
        let mut pll = slave(&mut sim);
        assert_eq!(pll.seq_state(), SeqState::ClearDacs);
        assert!(sim.out_tagger_enabled(0));
        pll.update(&mut sim);
        assert_eq!(pll.seq_state(), SeqState::WaitClearDacs);
        assert_eq!(sim.helper_dac, 65531);
        assert_eq!(sim.main_dac[0], 32767);
        run(&mut pll, &mut sim, &[0, 2], 1, 80);
        assert_eq!(pll.seq_state(), SeqState::Ready);
        assert!(pll.check_lock(0).unwrap());
        let stats = pll.stats(&sim);
        assert_eq!(stats.mode, 3);
        assert_eq!(stats.seq_state, 8);
        assert!(stats.helper_locked);
        assert!(stats.main_locked);
        assert_eq!(stats.delock_count, 0);
        assert_eq!(stats.start_count, 1);
    }

    #[test]
    fn helper_delock_restarts_the_sequencer() {
        let mut sim = SimRegisters::new(2, 2);
        let mut pll = slave(&mut sim);
        run(&mut pll, &mut sim, &[0, 2], 1, 80);
        assert_eq!(pll.seq_state(), SeqState::Ready);
        // stalled reference: the helper setpoint runs away and the lock
        // drops
        for _ in 0..10 {
            sim.push_tag(0, 0);
            sim.push_tag(2, 0);
            pll.on_interrupt(&mut sim);
            pll.update(&mut sim);
        }
        assert_ne!(pll.seq_state(), SeqState::Ready);
        assert_eq!(pll.stats(&sim).delock_count, 1);
        // a clean stream brings it all the way back
        run(&mut pll, &mut sim, &[0, 2], 200, 80);
        assert_eq!(pll.seq_state(), SeqState::Ready);
        assert_eq!(pll.stats(&sim).delock_count, 1);
    }

    #[test]
    fn aux_channel_follows_the_enable_request() {
        let mut sim = SimRegisters::new(2, 2);
        let mut pll = slave(&mut sim);
        run(&mut pll, &mut sim, &[0, 2], 1, 80);
        assert!(!pll.aux_status(1).unwrap().enabled);
        assert!(!pll.check_lock(1).unwrap());
        sim.request_channel(1, true);
        run(&mut pll, &mut sim, &[0, 2, 3], 81, 40);
        let status = pll.aux_status(1).unwrap();
        assert!(status.enabled);
        assert!(status.locked);
        assert!(pll.check_lock(1).unwrap());
        assert_eq!(sim.occr.out_lock(), 0b10);
        // dropping the request stops the loop and clears the lock bit
        sim.request_channel(1, false);
        pll.update(&mut sim);
        assert!(!pll.aux_status(1).unwrap().enabled);
        assert_eq!(sim.occr.out_lock(), 0);
        assert!(!sim.out_tagger_enabled(1));
    }

    #[test]
    fn grandmaster_without_input_hardware_is_inert() {
        let mut sim = SimRegisters::new(2, 1);
        let mut pll =
            SoftPll::new(&mut sim, quick(), Mode::GrandMaster, 0, true)
                .unwrap();
        assert_eq!(pll.seq_state(), SeqState::Disabled);
        pll.update(&mut sim);
        assert_eq!(pll.seq_state(), SeqState::Disabled);
        let stats = pll.stats(&sim);
        assert_eq!(stats.mode, 1);
        assert_eq!(stats.seq_state, 7);
        assert_eq!(stats.align_state, 0);
        assert!(!pll.external_locked(&sim));
    }

    #[test]
    fn grandmaster_aligns_to_the_external_input() {
        let mut sim = SimRegisters::new(2, 1);
        sim.support_external();
        let mut s = quick();
        // small search geometry so the test slews quickly
        s.external.period_ps = 50;
        s.external.align_step_ps = 5;
        s.external.compensation_ps = 5;
        s.external.settle_ticks = 1000;
        let mut pll =
            SoftPll::new(&mut sim, s, Mode::GrandMaster, 0, true).unwrap();
        assert_eq!(pll.seq_state(), SeqState::ClearDacs);
        sim.set_external(true, true);
        let mut rng = StdRng::seed_from_u64(1);
        // the helper runs on the local output, the aligner's loop locks
        // it to the conditioned external channel
        run_jittered(&mut pll, &mut sim, &mut rng, &[2, 3], 1, 60);
        assert_eq!(pll.seq_state(), SeqState::Ready);
        assert!(pll.check_lock(0).unwrap());
        assert!(!pll.external_locked(&sim));
        assert!(sim.pps_cr.sync());
        sim.complete_pps_sync();
        run_jittered(&mut pll, &mut sim, &mut rng, &[2, 3], 61, 5);
        assert_eq!(pll.stats(&sim).align_state, 8);
        // two high samples step the phase, the low one ends the search
        for n in 0..2 {
            sim.latch_sample(true);
            run_jittered(
                &mut pll,
                &mut sim,
                &mut rng,
                &[2, 3],
                66 + 25 * n,
                25,
            );
        }
        sim.latch_sample(false);
        run_jittered(&mut pll, &mut sim, &mut rng, &[2, 3], 116, 3);
        run_jittered(&mut pll, &mut sim, &mut rng, &[2, 3], 119, 30);
        assert!(pll.external_locked(&sim));
        let stats = pll.stats(&sim);
        assert_eq!(stats.align_state, 10);
        assert!(stats.main_locked);
        assert_eq!(stats.delock_count, 0);
        // losing the input drops back to conditioning and counts a
        // delock
        sim.set_external(false, false);
        for _ in 0..3 {
            pll.update(&mut sim);
        }
        assert_eq!(pll.seq_state(), SeqState::WaitExt);
        assert_eq!(pll.stats(&sim).delock_count, 1);
        assert!(!pll.external_locked(&sim));
    }

    #[test]
    fn slave_reference_must_exist() {
        let mut sim = SimRegisters::new(2, 2);
        assert!(matches!(
            SoftPll::new(&mut sim, quick(), Mode::Slave, 2, false),
            Err(Error::Channel(2))
        ));
    }

    #[test]
    fn phase_shifts_convert_to_picoseconds() {
        let mut sim = SimRegisters::new(2, 2);
        let mut pll = slave(&mut sim);
        pll.set_phase_shift(0, 8000).unwrap();
        assert!(pll.shifter_busy(0).unwrap());
        assert_eq!(pll.phase_shift(0).unwrap(), (0, 8000));
        assert!(pll.set_phase_shift(5, 0).is_err());
        assert!(pll.phase_shift(5).is_err());
    }

    #[test]
    fn dac_override_follows_the_selector() {
        let mut sim = SimRegisters::new(2, 2);
        let mut pll = slave(&mut sim);
        pll.set_dac(&mut sim, -1, 1234).unwrap();
        assert_eq!(sim.helper_dac, 1234);
        assert_eq!(pll.dac(-1).unwrap(), 1234);
        pll.set_dac(&mut sim, 0, 4321).unwrap();
        assert_eq!(sim.main_dac[0], 4321);
        assert_eq!(pll.dac(0).unwrap(), 4321);
        pll.set_dac(&mut sim, 1, 99).unwrap();
        assert_eq!(sim.main_dac[1], 99);
        assert_eq!(pll.dac(1).unwrap(), 99);
        assert!(pll.set_dac(&mut sim, 2, 0).is_err());
    }

    #[test]
    fn ptracker_measures_against_the_local_output() {
        let mut sim = SimRegisters::new(2, 2);
        let mut pll = slave(&mut sim);
        run(&mut pll, &mut sim, &[0, 2], 1, 80);
        pll.enable_ptracker(&mut sim, 0, true).unwrap();
        // sentinel first in every round, both channels in phase
        run(&mut pll, &mut sim, &[2, 0], 81, 20);
        assert_eq!(
            pll.read_ptracker(0).unwrap(),
            PtrackerReading {
                phase_ps: 0,
                enabled: true,
                ready: true
            }
        );
        assert!(pll.enable_ptracker(&mut sim, 5, true).is_err());
        // the main loop's reference tagger survives tracker shutdown
        pll.enable_ptracker(&mut sim, 0, false).unwrap();
        assert!(sim.ref_tagger_enabled(0));
        assert!(!pll.read_ptracker(0).unwrap().enabled);
    }

    #[test]
    fn reinit_preserves_the_tracker_mask() {
        let mut sim = SimRegisters::new(2, 2);
        let mut pll = slave(&mut sim);
        pll.enable_ptracker(&mut sim, 1, true).unwrap();
        pll.init(&mut sim, Mode::FreeRunningMaster, 0, false).unwrap();
        assert_eq!(pll.stats(&sim).start_count, 2);
        assert_eq!(pll.stats(&sim).delock_count, 0);
        assert!(!sim.ref_tagger_enabled(1));
        // the master's helper runs on the local output channel
        run(&mut pll, &mut sim, &[2], 1, 40);
        assert_eq!(pll.seq_state(), SeqState::Ready);
        // reaching ready rearmed the remembered tracker
        assert!(sim.ref_tagger_enabled(1));
    }

    #[test]
    fn tag_log_records_dispatched_tags() {
        let mut sim = SimRegisters::new(2, 2);
        let mut pll = slave(&mut sim);
        pll.enable_tag_log(true);
        sim.push_tag(0, 5);
        sim.push_tag(2, 7);
        pll.on_interrupt(&mut sim);
        let mut log = pll.tag_log().iter();
        assert_eq!(
            log.next(),
            Some(&TagRecord { source: 0, value: 5, index: 0 })
        );
        assert_eq!(
            log.next(),
            Some(&TagRecord { source: 2, value: 7, index: 1 })
        );
        assert_eq!(log.next(), None);
        assert_eq!(pll.stats(&sim).irq_count, 1);
    }

    #[test]
    fn pps_time_reads_both_counters() {
        let mut sim = SimRegisters::new(2, 2);
        sim.seconds = 41;
        sim.cycles = 12345;
        assert_eq!(pps_time(&sim), (41, 12345));
    }

    #[test]
    fn shutdown_parks_everything() {
        let mut sim = SimRegisters::new(2, 2);
        let mut pll = slave(&mut sim);
        run(&mut pll, &mut sim, &[0, 2], 1, 80);
        assert_eq!(pll.seq_state(), SeqState::Ready);
        pll.shutdown(&mut sim);
        assert_eq!(pll.seq_state(), SeqState::Disabled);
        assert_eq!(sim.rcer, 0);
        assert_eq!(sim.ocer, 0);
    }
}
