//! SoftPLL tuning settings.
//!
//! Defaults reproduce the values the loops were tuned with against the
//! reference gateware. Everything here is plain runtime data, so a
//! settings interface can retune an instance and restart the affected
//! loop without rebuilding the firmware. The picosecond scale factors
//! and the slew limits are board specific and deliberately live here
//! instead of in constants.

use miniconf::Tree;
use serde::{Deserialize, Serialize};
use spll_dsp::{Error, LockDetector, Pi};

use crate::convert::PhaseScale;
use crate::hardware::TICKS_PER_SECOND;

/// PI gains and output range of one control loop.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Tree, Serialize, Deserialize)]
#[tree(meta(doc, typename))]
pub struct LoopGains {
    /// Proportional gain, `1 << spll_dsp::PI_FRACBITS` is unity.
    pub kp: i32,
    /// Integral gain per sample.
    pub ki: i32,
    /// Output driven while the integrator is empty.
    pub bias: i32,
    /// Lower DAC clamp.
    pub y_min: i32,
    /// Upper DAC clamp.
    pub y_max: i32,
}

impl LoopGains {
    /// Build the regulator, reset and ready to run.
    pub fn pi(&self) -> Pi {
        Pi::new(self.kp, self.ki, self.bias, self.y_min, self.y_max)
    }
}

/// Lock detector window of one control loop.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Tree, Serialize, Deserialize)]
#[tree(meta(doc, typename))]
pub struct LockWindow {
    /// Absolute phase error accepted as in lock.
    pub threshold: i32,
    /// Consecutive in-threshold samples required to declare lock.
    pub lock_samples: u32,
    /// Counter floor at which the lock is dropped.
    pub delock_samples: u32,
}

impl LockWindow {
    /// Build the detector.
    pub fn detector(&self) -> Result<LockDetector, Error> {
        LockDetector::new(
            self.threshold,
            self.lock_samples,
            self.delock_samples,
        )
    }
}

/// Helper (DMTD offset oscillator) loop tuning.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Tree, Serialize, Deserialize)]
#[tree(meta(doc, typename))]
pub struct HelperSettings {
    /// Regulator gains. The bias is replaced by `y_max` on start so the
    /// loop acquires on the positive slope.
    pub gains: LoopGains,
    /// Lock window.
    pub window: LockWindow,
    /// Phase error clamp ahead of the regulator.
    pub error_clamp: i32,
}

impl Default for HelperSettings {
    fn default() -> Self {
        Self {
            gains: LoopGains {
                kp: 150,
                ki: 2,
                bias: 65531,
                y_min: 5,
                y_max: 65531,
            },
            window: LockWindow {
                threshold: 200,
                lock_samples: 10000,
                delock_samples: 100,
            },
            error_clamp: 150_000,
        }
    }
}

/// Main and aux channel loop tuning.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Tree, Serialize, Deserialize)]
#[tree(meta(doc, typename))]
pub struct MainSettings {
    /// Regulator gains.
    pub gains: LoopGains,
    /// Lock window.
    pub window: LockWindow,
    /// Updates per one-unit phase setpoint step. Bounds the output phase
    /// slew rate while a shift is in progress.
    pub shifter_speed: u32,
}

impl Default for MainSettings {
    fn default() -> Self {
        Self {
            gains: LoopGains {
                kp: 1500,
                ki: 7,
                bias: 65000,
                y_min: 5,
                y_max: 65530,
            },
            window: LockWindow {
                threshold: 1200,
                lock_samples: 1000,
                delock_samples: 100,
            },
            shifter_speed: 100,
        }
    }
}

/// External 10 MHz reference alignment tuning. The dedicated loop locking
/// the output to the conditioned external channel runs on
/// [`MainSettings`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Tree, Serialize, Deserialize)]
#[tree(meta(doc, typename))]
pub struct ExternalSettings {
    /// External reference period in picoseconds.
    pub period_ps: i64,
    /// Settle deadline on a PPS counter sync request, in foreground
    /// ticks.
    pub settle_ticks: u32,
    /// Phase search step per alignment sample, picoseconds.
    pub align_step_ps: i64,
    /// Fixed sampling path delay removed once aligned, picoseconds.
    /// Board calibration value.
    pub compensation_ps: i64,
}

impl Default for ExternalSettings {
    fn default() -> Self {
        Self {
            period_ps: 100_000,
            settle_ticks: 2 * TICKS_PER_SECOND,
            align_step_ps: 100,
            compensation_ps: 0,
        }
    }
}

/// Complete SoftPLL tuning.
#[derive(Clone, Debug, PartialEq, Tree, Serialize, Deserialize)]
#[tree(meta(doc, typename))]
pub struct Settings {
    /// Phase unit scale shared by all loops.
    pub scale: PhaseScale,
    /// Helper loop.
    pub helper: HelperSettings,
    /// Main and aux channel loops.
    pub main: MainSettings,
    /// External reference loop.
    pub external: ExternalSettings,
    /// Phase tracker averaging window in samples.
    pub ptracker_average_samples: u32,
    /// Tagger deglitcher threshold programmed at init.
    pub deglitch_threshold: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scale: PhaseScale::default(),
            helper: HelperSettings::default(),
            main: MainSettings::default(),
            external: ExternalSettings::default(),
            ptracker_average_samples: 512,
            deglitch_threshold: 1000,
        }
    }
}
