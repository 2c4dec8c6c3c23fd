//! Test hooks for deterministic split interleavings.
//!
//! Unlike process-wide hooks these live on the tree, so tests running in
//! parallel never see each other's hooks.
//!
//! # Usage
//!
//! ```rust,ignore
//! let barrier = Arc::new(Barrier::new(2));
//! let b = Arc::clone(&barrier);
//!
//! // The splitting thread stops after the child step...
//! tree.hooks.set_between_steps(Box::new(move || {
//!     b.wait(); // let the other thread observe the half-done split
//!     b.wait(); // wait until it has helped
//! }));
//! ```

use std::sync::atomic::AtomicBool;

use parking_lot::Mutex;

use crate::ordering::{READ_ORD, RELAXED};

/// Hook type: a boxed closure that takes no arguments.
pub(crate) type TestHook = Box<dyn Fn() + Send + Sync>;

/// Hooks consulted by the split protocol.
#[derive(Default)]
pub(crate) struct SplitHooks {
    /// Runs once, between the child step and the parent step.
    between_steps: Mutex<Option<TestHook>>,

    /// When set, splitters stop after the child step and leave the parent
    /// step to whoever meets the redirect.
    skip_parent_step: AtomicBool,
}

impl SplitHooks {
    /// Install a one-shot hook run by the next split between its steps.
    ///
    /// # Panics
    ///
    /// Panics if a hook is already installed.
    pub(crate) fn set_between_steps(&self, hook: TestHook) {
        let mut slot = self.between_steps.lock();
        assert!(slot.is_none(), "between-steps hook already set");
        *slot = Some(hook);
    }

    /// Take and run the hook, if any. The lock is released before the hook
    /// runs, so the hook may block on other threads that split.
    pub(super) fn call_between_steps(&self) {
        let hook: Option<TestHook> = self.between_steps.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Make splitters skip (or resume doing) the parent step.
    pub(crate) fn set_skip_parent_step(&self, skip: bool) {
        self.skip_parent_step.store(skip, RELAXED);
    }

    pub(super) fn skip_parent_step(&self) -> bool {
        self.skip_parent_step.load(READ_ORD)
    }
}
