// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::{ops::Add, time::Duration};

/// A point in time, relative to the owning [`Clock`]'s epoch
///
/// Lease expirations are stored as raw nanosecond counts in the descriptor
/// table, so the representation is exposed to the rest of the crate through
/// [`Timestamp::as_nanos`] and [`Timestamp::from_nanos`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    #[inline]
    pub(crate) const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub(crate) const fn as_nanos(self) -> u64 {
        self.0
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    #[inline]
    fn add(self, duration: Duration) -> Timestamp {
        Self(self.0.saturating_add(duration.as_nanos() as u64))
    }
}

/// A `Clock` is a source of [`Timestamp`]s.
pub trait Clock {
    /// Returns the current [`Timestamp`]
    fn get_time(&self) -> Timestamp;
}

impl<C: Clock> Clock for &C {
    #[inline]
    fn get_time(&self) -> Timestamp {
        (**self).get_time()
    }
}

mod std_clock {
    use super::*;
    use std::time::Instant;

    /// A monotonic clock backed by [`Instant`], with its epoch at construction
    #[derive(Clone, Copy, Debug)]
    pub struct StdClock {
        epoch: Instant,
    }

    impl Default for StdClock {
        fn default() -> Self {
            Self {
                epoch: Instant::now(),
            }
        }
    }

    impl Clock for StdClock {
        #[inline]
        fn get_time(&self) -> Timestamp {
            Timestamp::from_nanos(self.epoch.elapsed().as_nanos() as u64)
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)] // time isn't queryable in miri
    fn monotonicity_test() {
        let clock = StdClock::default();
        let ts1 = clock.get_time();
        ::std::thread::sleep(Duration::from_millis(50));
        let ts2 = clock.get_time();
        assert!(ts2 > ts1);
    }
}

pub use std_clock::StdClock;

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::{Duration, Timestamp};
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    /// A manually-advanced clock
    ///
    /// Clones share the same time source, so a test can hold one handle and
    /// advance the time observed by a pool holding another.
    #[derive(Clone, Debug, Default)]
    pub struct Clock(Arc<AtomicU64>);

    impl super::Clock for Clock {
        #[inline]
        fn get_time(&self) -> Timestamp {
            Timestamp::from_nanos(self.0.load(Ordering::SeqCst))
        }
    }

    impl Clock {
        pub fn inc_by(&self, duration: Duration) {
            self.0
                .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
        }

        pub fn set(&self, timestamp: Timestamp) {
            self.0.store(timestamp.as_nanos(), Ordering::SeqCst);
        }
    }

    #[test]
    fn advance_test() {
        use super::Clock as _;
        let clock = Clock::default();
        let handle = clock.clone();
        handle.inc_by(Duration::from_micros(5));
        assert_eq!(clock.get_time(), Timestamp::from_nanos(5_000));
    }
}
