//! Identity Resolver: maps threads and application handles to requests.
//!
//! A request is usually created on one thread (the accept loop, a parser)
//! and serviced on another. The resolver bridges that hand-off with two
//! tables: handle → request (associations) and thread → request (bindings).
//! Bindings also carry the start of the thread's current CPU interval.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tracing::debug;

use crate::config::RebindPolicy;
use crate::table::SlotTable;

pub type RequestId = u32;
pub type ThreadId = u32;
pub type Handle = u64;

/// What the resolver needs from request bookkeeping.
pub trait RequestLedger {
    /// Create the record for `id` if absent. False if it could not be stored.
    fn touch(&self, id: RequestId, now: u64) -> bool;

    /// Close the CPU interval `[started_at, now]` for `id`.
    fn flush_cpu_time(&self, id: RequestId, started_at: Option<u64>, now: u64) -> bool;
}

#[derive(Default)]
struct ThreadBinding {
    /// 0 when the thread is not serving a request.
    request: AtomicU32,
    started_at: AtomicU64,
}

/// A thread's current binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub request: RequestId,
    pub started_at: Option<u64>,
}

/// Result of a bind through a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Bound(RequestId),
    /// The thread already serves `existing` and the policy keeps it.
    AlreadyBound { existing: RequestId },
    /// Zero handle, no association for it, or no room to record the request.
    Unresolved,
}

fn thread_key(tid: ThreadId) -> u64 {
    u64::from(tid) + 1
}

fn nonzero(ts: u64) -> Option<u64> {
    (ts != 0).then_some(ts)
}

pub struct IdentityResolver {
    last_id: AtomicU32,
    associations: SlotTable<AtomicU32>,
    bindings: SlotTable<ThreadBinding>,
    rejected: AtomicU64,
}

impl IdentityResolver {
    pub fn new(handle_capacity: usize, thread_capacity: usize) -> Self {
        Self {
            last_id: AtomicU32::new(0),
            associations: SlotTable::with_capacity("associations", handle_capacity),
            bindings: SlotTable::with_capacity("bindings", thread_capacity),
            rejected: AtomicU64::new(0),
        }
    }

    /// Next request id from the process-wide counter. The first call returns 1.
    pub fn allocate_request_id(&self) -> RequestId {
        loop {
            let id = self.last_id.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Record `handle -> id`, creating the request record if needed.
    /// Overwrites any earlier association of the handle. Nothing is recorded
    /// when the request itself cannot be stored.
    pub fn associate(&self, handle: Handle, id: RequestId, now: u64, ledger: &impl RequestLedger) -> bool {
        if handle == 0 || id == 0 {
            return false;
        }
        if !ledger.touch(id, now) {
            debug!(handle, request_id = id, "no request record, dropping association");
            return false;
        }
        match self.associations.get_or_insert(handle) {
            Ok(entry) => {
                entry.value.store(id, Ordering::Release);
                debug!(handle, request_id = id, "associated handle");
                true
            }
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(handle, request_id = id, error = %e, "dropping association");
                false
            }
        }
    }

    /// Allocate a fresh id and associate `handle` with it.
    pub fn new_request(&self, handle: Handle, now: u64, ledger: &impl RequestLedger) -> Option<RequestId> {
        if handle == 0 {
            return None;
        }
        let id = self.allocate_request_id();
        self.associate(handle, id, now, ledger).then_some(id)
    }

    pub fn resolve_handle(&self, handle: Handle) -> Option<RequestId> {
        let entry = self.associations.get(handle)?;
        match entry.value.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn binding(&self, tid: ThreadId) -> Option<Binding> {
        let entry = self.bindings.get(thread_key(tid))?;
        match entry.value.request.load(Ordering::Acquire) {
            0 => None,
            request => Some(Binding {
                request,
                started_at: nonzero(entry.value.started_at.load(Ordering::Relaxed)),
            }),
        }
    }

    fn set_binding(&self, tid: ThreadId, id: RequestId, now: u64) -> bool {
        match self.bindings.get_or_insert(thread_key(tid)) {
            Ok(entry) => {
                entry.value.started_at.store(now, Ordering::Relaxed);
                entry.value.request.store(id, Ordering::Release);
                true
            }
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(tid, request_id = id, error = %e, "dropping thread binding");
                false
            }
        }
    }

    /// Bind `tid` to whatever request `handle` is associated with.
    pub fn bind_via_handle(
        &self,
        tid: ThreadId,
        handle: Handle,
        policy: RebindPolicy,
        now: u64,
        ledger: &impl RequestLedger,
    ) -> BindOutcome {
        if handle == 0 {
            return BindOutcome::Unresolved;
        }
        let Some(id) = self.resolve_handle(handle) else {
            return BindOutcome::Unresolved;
        };
        if policy == RebindPolicy::KeepExisting {
            if let Some(existing) = self.binding(tid) {
                debug!(tid, existing = existing.request, "thread already owns a request");
                return BindOutcome::AlreadyBound {
                    existing: existing.request,
                };
            }
        }
        if !ledger.touch(id, now) {
            debug!(tid, request_id = id, "no request record, leaving thread unbound");
            return BindOutcome::Unresolved;
        }
        if !self.set_binding(tid, id, now) {
            return BindOutcome::Unresolved;
        }
        debug!(tid, request_id = id, handle, "bound thread via handle");
        BindOutcome::Bound(id)
    }

    /// Bind `tid` straight to `id`, replacing any existing binding.
    pub fn bind_direct(&self, tid: ThreadId, id: RequestId, now: u64, ledger: &impl RequestLedger) -> bool {
        if id == 0 {
            return false;
        }
        if !ledger.touch(id, now) {
            debug!(tid, request_id = id, "no request record, leaving thread unbound");
            return false;
        }
        let bound = self.set_binding(tid, id, now);
        if bound {
            debug!(tid, request_id = id, "bound thread directly");
        }
        bound
    }

    /// Flush the thread's CPU interval into its request and drop the binding.
    pub fn unbind(&self, tid: ThreadId, now: u64, ledger: &impl RequestLedger) -> Option<RequestId> {
        let entry = self.bindings.get(thread_key(tid))?;
        let id = entry.value.request.swap(0, Ordering::AcqRel);
        if id == 0 {
            return None;
        }
        let started_at = entry.value.started_at.swap(0, Ordering::Relaxed);
        ledger.flush_cpu_time(id, nonzero(started_at), now);
        debug!(tid, request_id = id, "unbound thread");
        Some(id)
    }

    /// `bind_direct` then `unbind` within a single event.
    pub fn bind_and_flush(&self, tid: ThreadId, id: RequestId, now: u64, ledger: &impl RequestLedger) -> Option<RequestId> {
        if !self.bind_direct(tid, id, now, ledger) {
            return None;
        }
        self.unbind(tid, now, ledger)
    }

    /// Associate `handle` with the request `tid` is currently serving.
    pub fn propagate(&self, tid: ThreadId, handle: Handle, now: u64, ledger: &impl RequestLedger) -> Option<RequestId> {
        let id = self.binding(tid)?.request;
        self.associate(handle, id, now, ledger).then_some(id)
    }

    /// `propagate` then `unbind`; the thread hands its request off and stops serving it.
    pub fn propagate_and_release(
        &self,
        tid: ThreadId,
        handle: Handle,
        now: u64,
        ledger: &impl RequestLedger,
    ) -> Option<RequestId> {
        self.propagate(tid, handle, now, ledger)?;
        self.unbind(tid, now, ledger)
    }

    /// Close the running CPU interval of `tid` (if bound) and start a new one.
    pub fn checkpoint(&self, tid: ThreadId, now: u64, ledger: &impl RequestLedger) -> Option<RequestId> {
        let entry = self.bindings.get(thread_key(tid))?;
        let id = entry.value.request.load(Ordering::Acquire);
        if id == 0 {
            return None;
        }
        let started_at = entry.value.started_at.swap(now, Ordering::Relaxed);
        ledger.flush_cpu_time(id, nonzero(started_at), now);
        Some(id)
    }

    /// A scheduler switch from `prev` to `next`: `prev`'s interval ends, `next`'s starts.
    pub fn context_switch(&self, prev: ThreadId, next: ThreadId, now: u64, ledger: &impl RequestLedger) {
        if let Some(binding) = self.binding(prev) {
            ledger.flush_cpu_time(binding.request, binding.started_at, now);
        }
        if let Some(entry) = self.bindings.get(thread_key(next)) {
            if entry.value.request.load(Ordering::Acquire) != 0 {
                entry.value.started_at.store(now, Ordering::Relaxed);
            }
        }
    }

    pub fn association_count(&self) -> usize {
        self.associations.len()
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every ledger call for inspection.
    #[derive(Default)]
    struct Recorder {
        touched: Mutex<Vec<RequestId>>,
        flushed: Mutex<Vec<(RequestId, Option<u64>, u64)>>,
        /// Refuse every new record, as a full request table does.
        full: bool,
    }

    impl RequestLedger for Recorder {
        fn touch(&self, id: RequestId, _now: u64) -> bool {
            self.touched.lock().unwrap().push(id);
            !self.full
        }

        fn flush_cpu_time(&self, id: RequestId, started_at: Option<u64>, now: u64) -> bool {
            self.flushed.lock().unwrap().push((id, started_at, now));
            true
        }
    }

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(64, 16)
    }

    #[test]
    fn test_allocate_starts_at_one_and_increases() {
        let r = resolver();
        assert_eq!(r.allocate_request_id(), 1);
        assert_eq!(r.allocate_request_id(), 2);
        assert_eq!(r.allocate_request_id(), 3);
    }

    #[test]
    fn test_allocate_is_unique_across_threads() {
        let r = resolver();
        let mut ids: Vec<RequestId> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| (0..250).map(|_| r.allocate_request_id()).collect::<Vec<_>>()))
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 1_000);
        assert_eq!(ids.first(), Some(&1));
        assert_eq!(ids.last(), Some(&1_000));
    }

    #[test]
    fn test_zero_handle_is_never_associated() {
        let r = resolver();
        let ledger = Recorder::default();
        assert!(!r.associate(0, 5, 1, &ledger));
        assert_eq!(r.new_request(0, 1, &ledger), None);
        assert_eq!(r.resolve_handle(0), None);
        assert!(ledger.touched.lock().unwrap().is_empty());
        assert_eq!(r.association_count(), 0);
    }

    #[test]
    fn test_associate_creates_record_and_overwrites() {
        let r = resolver();
        let ledger = Recorder::default();
        assert!(r.associate(42, 1, 10, &ledger));
        assert!(r.associate(42, 2, 11, &ledger));
        assert_eq!(r.resolve_handle(42), Some(2));
        assert_eq!(*ledger.touched.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_unrecorded_request_is_never_referenced() {
        let r = resolver();
        let ledger = Recorder {
            full: true,
            ..Recorder::default()
        };
        assert!(!r.associate(9, 2, 1, &ledger));
        assert_eq!(r.resolve_handle(9), None);
        assert!(!r.bind_direct(4, 2, 2, &ledger));
        assert_eq!(r.binding(4), None);
        assert!(ledger.flushed.lock().unwrap().is_empty());

        // A handle associated earlier cannot bind a thread to a request
        // that is no longer recordable.
        let ok = Recorder::default();
        assert!(r.associate(10, 3, 3, &ok));
        assert_eq!(
            r.bind_via_handle(5, 10, RebindPolicy::Overwrite, 4, &ledger),
            BindOutcome::Unresolved
        );
        assert_eq!(r.binding(5), None);
    }

    #[test]
    fn test_bind_via_unknown_handle_is_noop() {
        let r = resolver();
        let ledger = Recorder::default();
        assert_eq!(
            r.bind_via_handle(7, 99, RebindPolicy::Overwrite, 1, &ledger),
            BindOutcome::Unresolved
        );
        assert_eq!(r.binding(7), None);
    }

    #[test]
    fn test_keep_existing_refuses_rebind() {
        let r = resolver();
        let ledger = Recorder::default();
        r.associate(1, 10, 0, &ledger);
        r.associate(2, 20, 0, &ledger);
        assert_eq!(
            r.bind_via_handle(7, 1, RebindPolicy::KeepExisting, 5, &ledger),
            BindOutcome::Bound(10)
        );
        assert_eq!(
            r.bind_via_handle(7, 2, RebindPolicy::KeepExisting, 6, &ledger),
            BindOutcome::AlreadyBound { existing: 10 }
        );
        assert_eq!(
            r.binding(7),
            Some(Binding {
                request: 10,
                started_at: Some(5)
            })
        );
    }

    #[test]
    fn test_overwrite_rebinds_and_restarts_interval() {
        let r = resolver();
        let ledger = Recorder::default();
        r.associate(1, 10, 0, &ledger);
        r.associate(2, 20, 0, &ledger);
        r.bind_via_handle(7, 1, RebindPolicy::Overwrite, 5, &ledger);
        assert_eq!(
            r.bind_via_handle(7, 2, RebindPolicy::Overwrite, 9, &ledger),
            BindOutcome::Bound(20)
        );
        assert_eq!(
            r.binding(7),
            Some(Binding {
                request: 20,
                started_at: Some(9)
            })
        );
    }

    #[test]
    fn test_thread_follows_latest_association() {
        let r = resolver();
        let ledger = Recorder::default();
        r.associate(42, 1, 0, &ledger);
        r.associate(42, 3, 0, &ledger);
        r.bind_via_handle(8, 42, RebindPolicy::KeepExisting, 1, &ledger);
        assert_eq!(r.binding(8).map(|b| b.request), Some(3));
    }

    #[test]
    fn test_unbind_flushes_then_removes() {
        let r = resolver();
        let ledger = Recorder::default();
        assert!(r.bind_direct(3, 77, 100, &ledger));
        assert_eq!(r.unbind(3, 160, &ledger), Some(77));
        assert_eq!(*ledger.flushed.lock().unwrap(), vec![(77, Some(100), 160)]);
        assert_eq!(r.binding(3), None);
        assert_eq!(r.unbind(3, 200, &ledger), None);
        assert_eq!(ledger.flushed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_bind_direct_rejects_zero_id() {
        let r = resolver();
        let ledger = Recorder::default();
        assert!(!r.bind_direct(3, 0, 1, &ledger));
        assert_eq!(r.binding(3), None);
    }

    #[test]
    fn test_bind_and_flush_leaves_thread_unbound() {
        let r = resolver();
        let ledger = Recorder::default();
        r.bind_direct(4, 1, 10, &ledger);
        assert_eq!(r.bind_and_flush(4, 2, 50, &ledger), Some(2));
        assert_eq!(r.binding(4), None);
        assert_eq!(*ledger.flushed.lock().unwrap(), vec![(2, Some(50), 50)]);
    }

    #[test]
    fn test_propagate_uses_current_binding() {
        let r = resolver();
        let ledger = Recorder::default();
        assert_eq!(r.propagate(5, 900, 1, &ledger), None);
        r.bind_direct(5, 12, 1, &ledger);
        assert_eq!(r.propagate(5, 900, 2, &ledger), Some(12));
        assert_eq!(r.resolve_handle(900), Some(12));
        assert_eq!(r.propagate(5, 0, 2, &ledger), None);

        assert_eq!(r.propagate_and_release(5, 901, 30, &ledger), Some(12));
        assert_eq!(r.resolve_handle(901), Some(12));
        assert_eq!(r.binding(5), None);
        assert_eq!(*ledger.flushed.lock().unwrap(), vec![(12, Some(1), 30)]);
    }

    #[test]
    fn test_checkpoint_restarts_interval() {
        let r = resolver();
        let ledger = Recorder::default();
        assert_eq!(r.checkpoint(6, 5, &ledger), None);
        r.bind_direct(6, 3, 10, &ledger);
        assert_eq!(r.checkpoint(6, 25, &ledger), Some(3));
        assert_eq!(r.checkpoint(6, 40, &ledger), Some(3));
        assert_eq!(
            *ledger.flushed.lock().unwrap(),
            vec![(3, Some(10), 25), (3, Some(25), 40)]
        );
    }

    #[test]
    fn test_context_switch_flushes_prev_and_restarts_next() {
        let r = resolver();
        let ledger = Recorder::default();
        r.bind_direct(1, 100, 10, &ledger);
        r.bind_direct(2, 200, 10, &ledger);
        r.context_switch(1, 2, 30, &ledger);
        assert_eq!(*ledger.flushed.lock().unwrap(), vec![(100, Some(10), 30)]);
        assert_eq!(r.binding(2).unwrap().started_at, Some(30));
        // Unbound threads are ignored on either side.
        r.context_switch(9, 8, 40, &ledger);
        assert_eq!(ledger.flushed.lock().unwrap().len(), 1);
        assert_eq!(r.binding(8), None);
    }

    #[test]
    fn test_thread_table_full_drops_binding() {
        let r = IdentityResolver::new(4, 1);
        let ledger = Recorder::default();
        assert!(r.bind_direct(1, 1, 1, &ledger));
        assert!(!r.bind_direct(2, 1, 1, &ledger));
        assert_eq!(r.rejected(), 1);
        // The thread that owns the slot can rebind freely.
        r.unbind(1, 2, &ledger);
        assert!(r.bind_direct(1, 2, 3, &ledger));
    }
}
