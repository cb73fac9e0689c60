#![cfg_attr(not(test), no_std)]

mod lock;
pub use lock::*;
mod lowpass;
pub use lowpass::*;
mod pi;
pub use pi::*;
mod wrap;
pub use wrap::*;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Lock window: delock samples {0} must be below lock samples {1}")]
    LockWindow(u32, u32),
}
