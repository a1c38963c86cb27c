//! Explicit session identity.

use groupfi_core::MemberAddr;

/// The acting member's identity, derived from an authenticated session
/// context and threaded explicitly into every create/vote operation.
///
/// There is deliberately no process-wide current user: multiple sessions
/// can coexist (and do, in tests).
#[derive(Debug, Clone)]
pub struct Session {
    identity: MemberAddr,
}

impl Session {
    #[must_use]
    pub fn new(identity: MemberAddr) -> Self {
        Self { identity }
    }

    #[must_use]
    pub fn identity(&self) -> &MemberAddr {
        &self.identity
    }
}
