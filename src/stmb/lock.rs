use crate::error::StmbError;
use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide "operation in flight" flag. Acquisition never blocks: a
/// second caller is turned away while the first holds the guard.
#[derive(Debug)]
pub struct ProcessingFlag {
    label: &'static str,
    busy: AtomicBool,
}

/// Clears the flag when dropped, on every exit path.
#[derive(Debug)]
pub struct FlagGuard<'a> {
    flag: &'a ProcessingFlag,
}

impl ProcessingFlag {
    pub const fn new(label: &'static str) -> Self {
        Self {
            label,
            busy: AtomicBool::new(false),
        }
    }

    pub fn try_acquire(&self) -> Option<FlagGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlagGuard { flag: self })
    }

    pub fn acquire_or_busy(&self) -> Result<FlagGuard<'_>, StmbError> {
        self.try_acquire().ok_or(StmbError::Busy(self.label))
    }

    pub fn is_held(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_rejected_until_guard_drops() {
        let flag = ProcessingFlag::new("memory generation");
        let guard = flag.try_acquire().expect("first");
        assert!(flag.is_held());
        let err = flag.acquire_or_busy().expect_err("busy");
        assert_eq!(err.to_string(), "memory generation is already in progress");
        drop(guard);
        assert!(!flag.is_held());
        assert!(flag.try_acquire().is_some());
    }

    #[test]
    fn guard_releases_on_early_return() {
        fn work(flag: &ProcessingFlag) -> Result<(), StmbError> {
            let _guard = flag.acquire_or_busy()?;
            Err(StmbError::InvalidScene("boom".to_string()))
        }
        let flag = ProcessingFlag::new("arc consolidation");
        assert!(work(&flag).is_err());
        assert!(!flag.is_held());
    }

    #[test]
    fn only_one_thread_wins_a_race() {
        let flag = ProcessingFlag::new("memory generation");
        let barrier = std::sync::Barrier::new(8);
        let wins = std::thread::scope(|scope| {
            let handles = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        let guard = flag.try_acquire();
                        let won = guard.is_some();
                        barrier.wait();
                        won
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .filter_map(|h| h.join().ok())
                .filter(|won| *won)
                .count()
        });
        assert_eq!(wins, 1);
        assert!(!flag.is_held());
    }
}
