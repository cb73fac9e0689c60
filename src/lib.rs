//! Software phase locked loop core for White Rabbit timing nodes.
//!
//! A DMTD phase detection core timestamps clock edges into a tag FIFO;
//! this crate closes the loops over those tags. The [`helper::Helper`]
//! loop offsets the DMTD sampling oscillator from the reference, the
//! [`mpll::Mpll`] loops lock the output oscillators, and in grandmaster
//! mode [`external::ExternalAligner`] aligns the node to an external
//! 10 MHz input. [`softpll::SoftPll`] sequences them and carries the
//! host API.
//!
//! All hardware access goes through [`hardware::SpllRegisters`], so the
//! whole crate runs unchanged against [`hardware::sim::SimRegisters`]
//! on the host.

#![cfg_attr(not(test), no_std)]

pub mod convert;
pub mod external;
pub mod hardware;
pub mod helper;
pub mod mpll;
pub mod ptracker;
pub mod settings;
pub mod softpll;
pub mod telemetry;

/// SoftPLL errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Invalid loop tuning.
    #[error(transparent)]
    Dsp(#[from] spll_dsp::Error),
    /// Channel number outside the core's complement.
    #[error("channel {0} out of range")]
    Channel(usize),
}
