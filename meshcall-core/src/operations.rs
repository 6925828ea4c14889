//! Admission bookkeeping for the asynchronous setup operations of a call.
//!
//! Setup is not a linear state machine: several steps (link creation, audio
//! init, call-room join, avatar fetch) can be in flight concurrently and some
//! are only required for group calls. Each operation therefore tracks its own
//! `requested`/`done` pair plus a bounded retry counter, and admission is a
//! non-blocking test-and-set.

use parking_lot::Mutex;

/// One asynchronous setup step of a call or connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Create the outgoing transport link
    CreateOutgoingPeerConnection,
    /// Create the incoming transport link
    CreateIncomingPeerConnection,
    /// Initialize the audio path on the link
    InitAudioConnection,
    /// The transport link object exists
    CreatedPeerConnection,
    /// Join the call room we were invited to
    JoinCallRoom,
    /// Invite the peer into our call room
    InviteCallRoom,
    /// Fetch the participant avatar
    GetParticipantAvatar,
    /// Create the call room on the server (call-level)
    CreateCallRoom,
}

impl Operation {
    const COUNT: usize = 8;

    fn index(self) -> usize {
        match self {
            Self::CreateOutgoingPeerConnection => 0,
            Self::CreateIncomingPeerConnection => 1,
            Self::InitAudioConnection => 2,
            Self::CreatedPeerConnection => 3,
            Self::JoinCallRoom => 4,
            Self::InviteCallRoom => 5,
            Self::GetParticipantAvatar => 6,
            Self::CreateCallRoom => 7,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct OperationState {
    requested: bool,
    done: bool,
    ready: bool,
    retries: u8,
}

/// Requested/done/retry bookkeeping for every [`Operation`].
///
/// All methods are non-blocking; the short internal lock is never held across
/// an await point.
#[derive(Debug, Default)]
pub struct OperationSet {
    states: Mutex<[OperationState; Operation::COUNT]>,
}

impl OperationSet {
    /// Create an empty set: nothing requested, nothing done
    pub fn new() -> Self {
        Self::default()
    }

    /// Test-and-set admission. Returns true exactly when the caller must
    /// perform the operation; a second call without an intervening
    /// [`retry`](Self::retry) returns false.
    pub fn check(&self, op: Operation) -> bool {
        let mut states = self.states.lock();
        let state = &mut states[op.index()];
        if state.requested {
            return false;
        }
        state.requested = true;
        true
    }

    /// True once the operation completed. Monotonic.
    pub fn is_done(&self, op: Operation) -> bool {
        self.states.lock()[op.index()].done
    }

    /// Fan-in chaining check: reports whether `op` completed, and when it has
    /// not, marks `ready_for` eligible so the completion path of `op` starts
    /// it without racing the caller.
    pub fn is_done_ready_for(&self, op: Operation, ready_for: Operation) -> bool {
        let mut states = self.states.lock();
        if states[op.index()].done {
            return true;
        }
        states[ready_for.index()].ready = true;
        false
    }

    /// Record completion of the operation. Completion of an operation that
    /// was never requested is a protocol bug upstream and is ignored.
    pub fn mark_done(&self, op: Operation) {
        let mut states = self.states.lock();
        let state = &mut states[op.index()];
        if state.requested {
            state.done = true;
        }
    }

    /// Consume the `ready` mark set by [`is_done_ready_for`](Self::is_done_ready_for).
    /// Returns true when a chained operation is waiting to be started.
    pub fn take_ready(&self, op: Operation) -> bool {
        let mut states = self.states.lock();
        let state = &mut states[op.index()];
        let ready = state.ready;
        state.ready = false;
        ready
    }

    /// Report a failed attempt. Clears the `requested` flag so the operation
    /// can be admitted once more, and returns true while the retry budget is
    /// not exhausted. Once the ceiling is reached every call returns false.
    pub fn retry(&self, op: Operation, ceiling: u8) -> bool {
        let mut states = self.states.lock();
        let state = &mut states[op.index()];
        if state.retries >= ceiling {
            return false;
        }
        state.retries += 1;
        state.requested = false;
        state.done = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_admits_once() {
        let ops = OperationSet::new();
        assert!(ops.check(Operation::CreateOutgoingPeerConnection));
        assert!(!ops.check(Operation::CreateOutgoingPeerConnection));
        // Other operations are unaffected
        assert!(ops.check(Operation::InitAudioConnection));
    }

    #[test]
    fn test_done_is_monotonic() {
        let ops = OperationSet::new();
        assert!(!ops.is_done(Operation::JoinCallRoom));
        assert!(ops.check(Operation::JoinCallRoom));
        assert!(!ops.is_done(Operation::JoinCallRoom));
        ops.mark_done(Operation::JoinCallRoom);
        assert!(ops.is_done(Operation::JoinCallRoom));
        assert!(ops.is_done(Operation::JoinCallRoom));
    }

    #[test]
    fn test_done_requires_requested() {
        let ops = OperationSet::new();
        ops.mark_done(Operation::InviteCallRoom);
        assert!(!ops.is_done(Operation::InviteCallRoom));
    }

    #[test]
    fn test_retry_reopens_admission() {
        let ops = OperationSet::new();
        assert!(ops.check(Operation::CreateCallRoom));
        assert!(!ops.check(Operation::CreateCallRoom));

        assert!(ops.retry(Operation::CreateCallRoom, 3));
        assert!(ops.check(Operation::CreateCallRoom));
        assert!(!ops.check(Operation::CreateCallRoom));
    }

    #[test]
    fn test_retry_ceiling_is_final() {
        let ops = OperationSet::new();
        assert!(ops.check(Operation::InitAudioConnection));
        assert!(ops.retry(Operation::InitAudioConnection, 2));
        assert!(ops.retry(Operation::InitAudioConnection, 2));
        assert!(!ops.retry(Operation::InitAudioConnection, 2));
        // Still false on every later call
        assert!(!ops.retry(Operation::InitAudioConnection, 2));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Between two retries at most one check succeeds, no matter how
            // the calls interleave
            #[test]
            fn admission_is_exclusive(extra_checks in 1usize..8) {
                let ops = OperationSet::new();
                let mut admitted = 0;
                for _ in 0..extra_checks {
                    if ops.check(Operation::InitAudioConnection) {
                        admitted += 1;
                    }
                }
                prop_assert_eq!(admitted, 1);
            }

            #[test]
            fn retry_grants_never_exceed_ceiling(ceiling in 0u8..10, attempts in 0usize..32) {
                let ops = OperationSet::new();
                ops.check(Operation::CreateCallRoom);
                let mut granted = 0usize;
                for _ in 0..attempts {
                    if ops.retry(Operation::CreateCallRoom, ceiling) {
                        granted += 1;
                    }
                }
                prop_assert!(granted <= usize::from(ceiling));
            }

            #[test]
            fn done_stays_done_under_checks(checks in 0usize..8) {
                let ops = OperationSet::new();
                ops.check(Operation::JoinCallRoom);
                ops.mark_done(Operation::JoinCallRoom);
                for _ in 0..checks {
                    ops.check(Operation::JoinCallRoom);
                    prop_assert!(ops.is_done(Operation::JoinCallRoom));
                }
            }
        }
    }

    #[test]
    fn test_ready_for_chaining() {
        let ops = OperationSet::new();
        assert!(ops.check(Operation::CreateOutgoingPeerConnection));

        // Creation not done yet: init-audio becomes eligible instead
        assert!(!ops.is_done_ready_for(
            Operation::CreateOutgoingPeerConnection,
            Operation::InitAudioConnection
        ));
        assert!(ops.take_ready(Operation::InitAudioConnection));
        // The mark is consumed
        assert!(!ops.take_ready(Operation::InitAudioConnection));

        ops.mark_done(Operation::CreateOutgoingPeerConnection);
        assert!(ops.is_done_ready_for(
            Operation::CreateOutgoingPeerConnection,
            Operation::InitAudioConnection
        ));
    }
}
