use crate::stmb::arcs::FailedArcRun;
use crate::stmb::config::StmbConfig;
use crate::stmb::lock::ProcessingFlag;
use crate::stmb::pipeline::FailedMemory;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Long-lived engine state shared by every operation: configuration, the
/// two mutual-exclusion flags, and the last-failure slots.
#[derive(Debug)]
pub struct Engine {
    pub config: StmbConfig,
    pub(crate) memory_flag: ProcessingFlag,
    pub(crate) arc_flag: ProcessingFlag,
    dry_run: AtomicBool,
    range_hint_shown: AtomicBool,
    last_failure: Mutex<Option<FailedMemory>>,
    last_arc_failure: Mutex<Option<FailedArcRun>>,
}

impl Engine {
    pub fn new(config: StmbConfig) -> Self {
        Self {
            config,
            memory_flag: ProcessingFlag::new("memory generation"),
            arc_flag: ProcessingFlag::new("arc consolidation"),
            dry_run: AtomicBool::new(false),
            range_hint_shown: AtomicBool::new(false),
            last_failure: Mutex::new(None),
            last_arc_failure: Mutex::new(None),
        }
    }

    pub fn is_memory_processing(&self) -> bool {
        self.memory_flag.is_held()
    }

    /// A host generation started. Remembers whether it is a dry run and drops
    /// the stale memory failure.
    pub fn on_generation_started(&self, dry_run: bool) {
        self.dry_run.store(dry_run, Ordering::Release);
        self.set_last_failure(None);
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run.load(Ordering::Acquire)
    }

    /// True exactly once per engine.
    pub(crate) fn take_range_hint(&self) -> bool {
        !self.range_hint_shown.swap(true, Ordering::AcqRel)
    }

    pub fn last_failure(&self) -> Option<FailedMemory> {
        self.last_failure.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn set_last_failure(&self, failure: Option<FailedMemory>) {
        if let Ok(mut slot) = self.last_failure.lock() {
            *slot = failure;
        }
    }

    pub fn last_arc_failure(&self) -> Option<FailedArcRun> {
        self.last_arc_failure.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn set_last_arc_failure(&self, failure: Option<FailedArcRun>) {
        if let Ok(mut slot) = self.last_arc_failure.lock() {
            *slot = failure;
        }
    }
}
