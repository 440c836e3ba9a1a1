//! Backplane coordination: wired-or role elections and sync-wait consensus
//! across the modules sharing one crate's backplane (spec.md §4.6).
//!
//! No teacher file drives a shared bus election directly; this generalizes
//! the lock-free, never-block CAS style `drive/pci.rs` uses for its device
//! registration slot (`Result`-returning, no panics, retry-on-conflict)
//! to three independently-held roles.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{ApiError, ErrorCode};

const NONE_HELD: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    WiredOrTriggers,
    Run,
    Director,
}

/// One atomically-held backplane role. `holder` is `NONE_HELD` when vacant.
struct RoleSlot {
    holder: AtomicUsize,
}

impl RoleSlot {
    fn new() -> Self {
        Self { holder: AtomicUsize::new(NONE_HELD) }
    }

    /// Claim the role for `module` via compare-exchange; fails (without
    /// blocking) if another module already holds it (spec.md §4.6 I-1).
    fn request(&self, module: usize) -> Result<(), usize> {
        match self.holder.compare_exchange(NONE_HELD, module, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => Ok(()),
            Err(current) if current == module => Ok(()),
            Err(current) => Err(current),
        }
    }

    /// Release, but only if `module` is the current holder.
    fn release(&self, module: usize) -> bool {
        self.holder.compare_exchange(module, NONE_HELD, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    fn holder(&self) -> Option<usize> {
        match self.holder.load(Ordering::SeqCst) {
            NONE_HELD => None,
            m => Some(m),
        }
    }
}

/// Coordinates the three backplane roles plus the sync-wait consensus set
/// shared by every module in a crate (spec.md §4.6).
pub struct Backplane {
    wired_or_triggers: RoleSlot,
    run: RoleSlot,
    director: RoleSlot,
    sync_waiters: Mutex<Vec<bool>>,
}

impl Backplane {
    pub fn new(num_modules: usize) -> Self {
        Self {
            wired_or_triggers: RoleSlot::new(),
            run: RoleSlot::new(),
            director: RoleSlot::new(),
            sync_waiters: Mutex::new(vec![false; num_modules]),
        }
    }

    fn slot(&self, role: Role) -> &RoleSlot {
        match role {
            Role::WiredOrTriggers => &self.wired_or_triggers,
            Role::Run => &self.run,
            Role::Director => &self.director,
        }
    }

    /// Claim `role` for `module`. Fails with `not_leader` if another module
    /// already holds it (spec.md §4.6; this never blocks).
    pub fn request(&self, role: Role, module: usize) -> Result<(), ApiError> {
        self.slot(role).request(module).map_err(|holder| {
            ApiError::new(ErrorCode::ModuleInvalidOperation, format!("{:?} already held by module {}, not module {}", role, holder, module))
        })
    }

    pub fn release(&self, role: Role, module: usize) -> Result<(), ApiError> {
        if self.slot(role).release(module) {
            Ok(())
        } else {
            Err(ApiError::new(ErrorCode::ModuleInvalidOperation, format!("module {} does not hold {:?}", module, role)))
        }
    }

    pub fn holder(&self, role: Role) -> Option<usize> {
        self.slot(role).holder()
    }

    /// Is `module` NOT the current holder of `role`? Convenience used by
    /// boot/run paths that only need to special-case the leader.
    pub fn not_leader(&self, role: Role, module: usize) -> bool {
        self.holder(role) != Some(module)
    }

    /// Declare `module`'s SYNCH_WAIT intent (spec.md §4.6: writing the
    /// `SYNCH_WAIT` module parameter updates this set atomically).
    pub fn set_sync_wait(&self, module: usize, waiting: bool) -> Result<(), ApiError> {
        let mut waiters = self.sync_waiters.lock().unwrap_or_else(|p| p.into_inner());
        let slot = waiters
            .get_mut(module)
            .ok_or_else(|| ApiError::new(ErrorCode::ModuleNumberInvalid, format!("no such module {}", module)))?;
        *slot = waiting;
        Ok(())
    }

    /// `true` once every module that declared SYNCH_WAIT has reached the
    /// barrier (spec.md §4.6's sync-wait consensus).
    pub fn sync_wait_satisfied(&self) -> bool {
        let waiters = self.sync_waiters.lock().unwrap_or_else(|p| p.into_inner());
        waiters.iter().all(|w| *w)
    }

    /// Invariant check: a crate can never have more sync-waiters declared
    /// than modules present (spec.md §4.6 I-2); also surfaces whether any
    /// module has not yet declared, for diagnostics.
    pub fn sync_wait_report(&self) -> (usize, usize) {
        let waiters = self.sync_waiters.lock().unwrap_or_else(|p| p.into_inner());
        let declared = waiters.iter().filter(|w| **w).count();
        (declared, waiters.len())
    }

    /// A crate cannot run with some modules declaring SYNCH_WAIT and
    /// others not — every module must agree (spec.md §4.6, S6).
    pub fn sync_wait_valid(&self) -> Result<(), ApiError> {
        let waiters = self.sync_waiters.lock().unwrap_or_else(|p| p.into_inner());
        let all_wait = waiters.iter().all(|w| *w);
        let none_wait = waiters.iter().all(|w| !*w);
        if all_wait || none_wait {
            Ok(())
        } else {
            Err(ApiError::new(ErrorCode::ModuleInvalidOperation, "sync wait declarations are inconsistent across modules"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_then_request_by_other_fails() {
        let bp = Backplane::new(4);
        bp.request(Role::Director, 0).unwrap();
        let err = bp.request(Role::Director, 1).unwrap_err();
        assert_eq!(err.code, ErrorCode::ModuleInvalidOperation);
    }

    #[test]
    fn reentrant_request_by_same_module_succeeds() {
        let bp = Backplane::new(4);
        bp.request(Role::Run, 2).unwrap();
        bp.request(Role::Run, 2).unwrap();
        assert_eq!(bp.holder(Role::Run), Some(2));
    }

    #[test]
    fn release_by_non_holder_fails() {
        let bp = Backplane::new(4);
        bp.request(Role::WiredOrTriggers, 0).unwrap();
        assert!(bp.release(Role::WiredOrTriggers, 1).is_err());
        assert!(bp.release(Role::WiredOrTriggers, 0).is_ok());
        assert_eq!(bp.holder(Role::WiredOrTriggers), None);
    }

    #[test]
    fn roles_are_independent() {
        let bp = Backplane::new(4);
        bp.request(Role::Run, 0).unwrap();
        bp.request(Role::Director, 1).unwrap();
        assert_eq!(bp.holder(Role::Run), Some(0));
        assert_eq!(bp.holder(Role::Director), Some(1));
    }

    #[test]
    fn sync_wait_consensus_requires_all_declared() {
        let bp = Backplane::new(3);
        assert!(!bp.sync_wait_satisfied());
        bp.set_sync_wait(0, true).unwrap();
        bp.set_sync_wait(1, true).unwrap();
        assert!(!bp.sync_wait_satisfied());
        bp.set_sync_wait(2, true).unwrap();
        assert!(bp.sync_wait_satisfied());
        assert_eq!(bp.sync_wait_report(), (3, 3));
    }

    #[test]
    fn sync_wait_out_of_range_module_fails() {
        let bp = Backplane::new(2);
        assert!(bp.set_sync_wait(5, true).is_err());
    }

    #[test]
    fn sync_wait_valid_rejects_mixed_declarations() {
        let bp = Backplane::new(2);
        bp.set_sync_wait(0, true).unwrap();
        bp.set_sync_wait(1, false).unwrap();
        let err = bp.sync_wait_valid().unwrap_err();
        assert_eq!(err.code, ErrorCode::ModuleInvalidOperation);
        assert!(err.to_string().contains("sync wait"));
    }

    #[test]
    fn sync_wait_valid_accepts_uniform_declarations() {
        let bp = Backplane::new(2);
        assert!(bp.sync_wait_valid().is_ok());
        bp.set_sync_wait(0, true).unwrap();
        bp.set_sync_wait(1, true).unwrap();
        assert!(bp.sync_wait_valid().is_ok());
    }
}
