// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Abstracts the platform sleep primitive so the transport's polling loops
//! are unit-testable without real wall-clock delays.

use std::time::Duration;

pub trait Clock {
    fn sleep(&self, d: Duration);
}

/// Sleeps via `std::thread::sleep`.
pub struct RealClock;

impl Clock for RealClock {
    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

#[cfg(test)]
pub struct FakeClock {
    pub slept: std::cell::RefCell<Vec<Duration>>,
}

#[cfg(test)]
impl FakeClock {
    pub fn new() -> Self {
        FakeClock {
            slept: std::cell::RefCell::new(Vec::new()),
        }
    }
}

#[cfg(test)]
impl Clock for FakeClock {
    fn sleep(&self, d: Duration) {
        self.slept.borrow_mut().push(d);
    }
}
