use serde::{Deserialize, Serialize};

use crate::Error;

/// Lock classification reported by [`LockDetector::update`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Lock {
    /// Error magnitude has not stayed in threshold long enough.
    Unlocked,
    /// Error magnitude has stayed in threshold for the full lock window.
    Locked,
    /// The delock window was just crossed on this sample.
    JustUnlocked,
}

impl Lock {
    pub fn is_locked(&self) -> bool {
        matches!(self, Lock::Locked)
    }
}

/// Hysteretic lock detector
///
/// Classifies an error sample stream as locked or unlocked. The counter
/// ratchets up towards `lock_samples` on in-threshold samples and down
/// towards `delock_samples` on out-of-threshold samples. Locking requires
/// `lock_samples` consecutive good samples from scratch while unlocking
/// takes only `lock_samples - delock_samples` bad ones, so a brief
/// disturbance drops the lock long before a brief clean stretch could
/// re-acquire it.
#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize)]
pub struct LockDetector {
    threshold: i32,
    lock_samples: u32,
    delock_samples: u32,
    lock_cnt: u32,
    locked: bool,
    lock_changed: bool,
}

impl LockDetector {
    /// Build a detector.
    ///
    /// Args:
    /// * `threshold`: Error magnitude bound counted as "good".
    /// * `lock_samples`: Consecutive good samples required to lock.
    /// * `delock_samples`: Count floor at which the lock is dropped.
    ///   Must be below `lock_samples`.
    pub fn new(
        threshold: i32,
        lock_samples: u32,
        delock_samples: u32,
    ) -> Result<Self, Error> {
        if delock_samples >= lock_samples {
            return Err(Error::LockWindow(delock_samples, lock_samples));
        }
        Ok(Self {
            threshold,
            lock_samples,
            delock_samples,
            lock_cnt: 0,
            locked: false,
            lock_changed: false,
        })
    }

    /// Reset the detector to the unlocked state.
    pub fn reset(&mut self) {
        self.lock_cnt = 0;
        self.locked = false;
        self.lock_changed = false;
    }

    /// Update the detector with a new error sample.
    pub fn update(&mut self, y: i32) -> Lock {
        if y.unsigned_abs() <= self.threshold as u32 {
            if self.lock_cnt < self.lock_samples {
                self.lock_cnt += 1;
            }
            if self.lock_cnt == self.lock_samples {
                self.lock_changed |= !self.locked;
                self.locked = true;
                return Lock::Locked;
            }
        } else {
            if self.lock_cnt > self.delock_samples {
                self.lock_cnt -= 1;
            }
            if self.lock_cnt == self.delock_samples {
                self.lock_changed |= self.locked;
                self.lock_cnt = 0;
                self.locked = false;
                return Lock::JustUnlocked;
            }
        }
        if self.locked {
            Lock::Locked
        } else {
            Lock::Unlocked
        }
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    /// Read and clear the "lock state changed since last read" flag.
    pub fn take_change(&mut self) -> bool {
        core::mem::replace(&mut self.lock_changed, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_validation() {
        assert!(LockDetector::new(100, 10, 10).is_err());
        assert!(LockDetector::new(100, 10, 11).is_err());
        assert!(LockDetector::new(100, 10, 9).is_ok());
    }

    #[test]
    fn hysteresis() {
        let (l, d) = (10, 3);
        let mut ld = LockDetector::new(100, l, d).unwrap();
        for _ in 0..l - 1 {
            assert_eq!(ld.update(50), Lock::Unlocked);
        }
        assert_eq!(ld.update(-50), Lock::Locked);
        assert!(ld.locked());
        assert!(ld.take_change());
        assert!(!ld.take_change());

        // l - d bad samples drop the lock, one fewer does not
        for _ in 0..l - d - 1 {
            assert_eq!(ld.update(101), Lock::Locked);
        }
        assert_eq!(ld.update(101), Lock::JustUnlocked);
        assert!(!ld.locked());
        assert!(ld.take_change());
    }

    #[test]
    fn relock_starts_from_scratch() {
        let mut ld = LockDetector::new(100, 5, 1).unwrap();
        for _ in 0..5 {
            ld.update(0);
        }
        assert!(ld.locked());
        for _ in 0..4 {
            ld.update(1000);
        }
        assert!(!ld.locked());
        // counter was cleared, a partial clean stretch is not enough
        for _ in 0..4 {
            assert!(!ld.update(0).is_locked());
        }
        assert!(ld.update(0).is_locked());
    }

    #[test]
    fn threshold_is_inclusive() {
        let mut ld = LockDetector::new(100, 1, 0).unwrap();
        assert_eq!(ld.update(100), Lock::Locked);
        let mut ld = LockDetector::new(100, 1, 0).unwrap();
        assert_eq!(ld.update(-100), Lock::Locked);
    }
}
