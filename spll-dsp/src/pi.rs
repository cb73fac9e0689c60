use serde::{Deserialize, Serialize};

/// Fractional bits of the PI gain coefficients.
pub const PI_FRACBITS: u8 = 12;

/// Discrete time proportional-integral regulator
///
/// The regulator accumulates the raw error into its integrator and produces
/// `y = ((integrator*ki + x*kp) >> PI_FRACBITS) + bias`, clamped to
/// `[y_min, y_max]`. Gains are fixed-point with `PI_FRACBITS` fractional
/// bits and can be changed freely between updates.
///
/// With `anti_windup` set, the integrator is frozen while the output sits
/// on a clamp and the error keeps pushing it further out of range. It
/// resumes accumulating on the first sample whose trend points back inside
/// the output range, so recovery from saturation starts without the usual
/// windup lag.
///
/// All math is wrapping 32 bit integer. There is no rounding of the
/// `PI_FRACBITS` truncation; the resulting sub-LSB offset is absorbed by
/// the integrator.
#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize)]
pub struct Pi {
    /// Proportional gain.
    pub kp: i32,
    /// Integral gain.
    pub ki: i32,
    /// Output offset, applied after the gain stage.
    pub bias: i32,
    /// Lower output clamp.
    pub y_min: i32,
    /// Upper output clamp.
    pub y_max: i32,
    /// Freeze the integrator while the output is saturated.
    pub anti_windup: bool,
    // accumulated error
    integrator: i32,
    // last input
    x: i32,
    // last output
    y: i32,
}

impl Pi {
    /// Build a regulator with anti-windup on and the output seeded at
    /// `bias`.
    pub fn new(kp: i32, ki: i32, bias: i32, y_min: i32, y_max: i32) -> Self {
        Self {
            kp,
            ki,
            bias,
            y_min,
            y_max,
            anti_windup: true,
            integrator: 0,
            x: 0,
            y: bias,
        }
    }

    /// Reset the regulator state.
    ///
    /// Clears the integrator and seeds the output with the bias so that the
    /// first update does not report an artificial step.
    pub fn reset(&mut self) {
        self.integrator = 0;
        self.x = 0;
        self.y = self.bias;
    }

    /// Update the regulator with a new error sample.
    ///
    /// Args:
    /// * `x`: New error sample.
    ///
    /// Returns:
    /// The clamped actuator output.
    pub fn update(&mut self, x: i32) -> i32 {
        self.x = x;
        let i_new = self.integrator.wrapping_add(x);
        let y = (i_new
            .wrapping_mul(self.ki)
            .wrapping_add(x.wrapping_mul(self.kp))
            >> PI_FRACBITS)
            .wrapping_add(self.bias);
        let y = if y < self.y_min {
            if !self.anti_windup || i_new > self.integrator {
                self.integrator = i_new;
            }
            self.y_min
        } else if y > self.y_max {
            if !self.anti_windup || i_new < self.integrator {
                self.integrator = i_new;
            }
            self.y_max
        } else {
            self.integrator = i_new;
            y
        };
        self.y = y;
        y
    }

    /// Most recent output.
    pub fn y(&self) -> i32 {
        self.y
    }

    /// Force the output, for manual actuator override. The next update
    /// recomputes it from the loop state.
    pub fn set_y(&mut self, y: i32) {
        self.y = y;
    }

    /// Most recent input.
    pub fn x(&self) -> i32 {
        self.x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    fn unit() -> Pi {
        Pi {
            kp: 1 << PI_FRACBITS,
            ki: 0,
            bias: 0,
            y_min: -100,
            y_max: 100,
            anti_windup: true,
            ..Default::default()
        }
    }

    #[test]
    fn proportional() {
        let mut pi = unit();
        pi.reset();
        assert_eq!(pi.update(7), 7);
        assert_eq!(pi.update(-3), -3);
    }

    #[test]
    fn integrates() {
        let mut pi = Pi {
            ki: 1 << PI_FRACBITS,
            y_min: i32::MIN,
            y_max: i32::MAX,
            ..Default::default()
        };
        pi.reset();
        for i in 1..=5 {
            assert_eq!(pi.update(1), i);
        }
    }

    #[test]
    fn windup_freeze_and_recovery() {
        let mut pi = Pi {
            ki: 1 << PI_FRACBITS,
            y_min: -10,
            y_max: 10,
            anti_windup: true,
            ..Default::default()
        };
        pi.reset();
        for y in [3, 6, 9] {
            assert_eq!(pi.update(3), y);
        }
        for _ in 0..100 {
            assert_eq!(pi.update(3), 10);
        }
        // The integrator froze at 9 on the clamp. A reversed error acts
        // immediately instead of first unwinding 100 surplus samples.
        assert_eq!(pi.update(-3), 6);
    }

    #[test]
    fn windup_without_protection() {
        let mut pi = Pi {
            ki: 1 << PI_FRACBITS,
            y_min: -10,
            y_max: 10,
            anti_windup: false,
            ..Default::default()
        };
        pi.reset();
        for _ in 0..100 {
            pi.update(3);
        }
        // 300 accumulated, takes many reversed samples to come off the rail
        assert_eq!(pi.update(-3), 10);
    }

    #[test]
    fn bias_seeds_output() {
        let mut pi = Pi {
            bias: 65000,
            y_min: 5,
            y_max: 65530,
            ..Default::default()
        };
        pi.reset();
        assert_eq!(pi.y(), 65000);
        assert_eq!(pi.update(0), 65000);
    }

    quickcheck! {
        fn clamped(xs: Vec<i16>) -> bool {
            let mut pi = Pi {
                kp: 150,
                ki: 2,
                bias: 32000,
                y_min: 5,
                y_max: 65530,
                anti_windup: true,
                ..Default::default()
            };
            pi.reset();
            xs.iter().all(|x| {
                let y = pi.update(*x as i32);
                (pi.y_min..=pi.y_max).contains(&y)
            })
        }
    }
}
