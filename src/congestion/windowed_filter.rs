use std::fmt::Debug;
use std::marker::PhantomData;

pub trait FilterComparator: Debug + Clone + Send + Sync {
    /// Returns true if `a` should replace `b` as the best estimate.
    fn better_or_equal<T: PartialOrd>(a: &T, b: &T) -> bool;
}

#[derive(Debug, Clone)]
pub struct MaxFilter;

impl FilterComparator for MaxFilter {
    fn better_or_equal<T: PartialOrd>(a: &T, b: &T) -> bool {
        a >= b
    }
}

#[derive(Debug, Clone)]
pub struct MinFilter;

impl FilterComparator for MinFilter {
    fn better_or_equal<T: PartialOrd>(a: &T, b: &T) -> bool {
        a <= b
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Sample<T> {
    sample: T,
    time: u64,
}

/// Tracks the best, second best and third best samples seen within a sliding
/// window of `window_length` time units (round trips for BBR).
///
/// The second and third best are taken from the later quarter and half of
/// the window respectively, so when the best expires a recent substitute is
/// already available.
#[derive(Debug, Clone)]
pub struct WindowedFilter<T, C> {
    window_length: u64,
    zero_value: T,
    estimates: [Sample<T>; 3],
    _comparator: PhantomData<C>,
}

impl<T, C> WindowedFilter<T, C>
where
    T: Copy + PartialOrd + Default + Debug,
    C: FilterComparator,
{
    pub fn new(window_length: u64) -> Self {
        Self {
            window_length,
            zero_value: T::default(),
            estimates: [Sample::default(); 3],
            _comparator: PhantomData,
        }
    }

    pub fn set_window_length(&mut self, window_length: u64) {
        self.window_length = window_length;
    }

    pub fn best(&self) -> T {
        self.estimates[0].sample
    }

    pub fn second_best(&self) -> T {
        self.estimates[1].sample
    }

    pub fn third_best(&self) -> T {
        self.estimates[2].sample
    }

    pub fn update(&mut self, new_sample: T, new_time: u64) {
        // Reset if there is no estimate yet, the sample is a new best, or
        // even the third best has expired.
        if self.estimates[0].sample == self.zero_value
            || C::better_or_equal(&new_sample, &self.estimates[0].sample)
            || new_time.saturating_sub(self.estimates[2].time) > self.window_length
        {
            self.reset(new_sample, new_time);
            return;
        }

        if C::better_or_equal(&new_sample, &self.estimates[1].sample) {
            self.estimates[1] = Sample {
                sample: new_sample,
                time: new_time,
            };
            self.estimates[2] = self.estimates[1];
        } else if C::better_or_equal(&new_sample, &self.estimates[2].sample) {
            self.estimates[2] = Sample {
                sample: new_sample,
                time: new_time,
            };
        }

        // The best estimate expired, promote the second and third.
        if new_time.saturating_sub(self.estimates[0].time) > self.window_length {
            self.estimates[0] = self.estimates[1];
            self.estimates[1] = self.estimates[2];
            self.estimates[2] = Sample {
                sample: new_sample,
                time: new_time,
            };
            // The promoted estimate may have expired as well.
            if new_time.saturating_sub(self.estimates[0].time) > self.window_length {
                self.estimates[0] = self.estimates[1];
                self.estimates[1] = self.estimates[2];
            }
            return;
        }

        if self.estimates[1].sample == self.estimates[0].sample
            && new_time.saturating_sub(self.estimates[1].time) > self.window_length >> 2
        {
            // A quarter of the window passed without a better sample, take the
            // second best from the second quarter.
            self.estimates[1] = Sample {
                sample: new_sample,
                time: new_time,
            };
            self.estimates[2] = self.estimates[1];
            return;
        }

        if self.estimates[2].sample == self.estimates[1].sample
            && new_time.saturating_sub(self.estimates[2].time) > self.window_length >> 1
        {
            // Half the window passed, take the third best from the second half.
            self.estimates[2] = Sample {
                sample: new_sample,
                time: new_time,
            };
        }
    }

    pub fn reset(&mut self, new_sample: T, new_time: u64) {
        let sample = Sample {
            sample: new_sample,
            time: new_time,
        };
        self.estimates = [sample; 3];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_filter_tracks_best() {
        let mut filter: WindowedFilter<u64, MaxFilter> = WindowedFilter::new(10);
        filter.update(100, 1);
        assert_eq!(filter.best(), 100);
        filter.update(50, 2);
        assert_eq!(filter.best(), 100);
        filter.update(200, 3);
        assert_eq!(filter.best(), 200);
        assert_eq!(filter.second_best(), 200);
        assert_eq!(filter.third_best(), 200);
    }

    #[test]
    fn test_max_filter_expires() {
        let mut filter: WindowedFilter<u64, MaxFilter> = WindowedFilter::new(10);
        filter.update(1000, 1);
        for round in 2..=11 {
            filter.update(500, round);
            assert_eq!(filter.best(), 1000);
        }
        filter.update(400, 12);
        assert!(filter.best() < 1000);
        filter.update(300, 40);
        assert_eq!(filter.best(), 300);
    }

    #[test]
    fn test_min_filter() {
        let mut filter: WindowedFilter<u64, MinFilter> = WindowedFilter::new(4);
        filter.update(30, 1);
        filter.update(40, 2);
        assert_eq!(filter.best(), 30);
        filter.update(20, 3);
        assert_eq!(filter.best(), 20);
        filter.update(25, 10);
        assert_eq!(filter.best(), 25);
    }
}
