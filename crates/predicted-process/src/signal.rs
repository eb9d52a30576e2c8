//! Cancellation signals
//!
//! A [`CancelSource`] owns the pending → cancelled transition; the
//! [`CancelSignal`]s it hands out can only observe it. Signals compare by
//! identity: clones of one signal are equal, two signals created by
//! different sources never are, whatever their state.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

static NEXT_SIGNAL_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a cancellation signal, unique within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalId(u64);

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "signal-{}", self.0)
    }
}

/// Owner side of a cancellation signal
#[derive(Debug)]
pub struct CancelSource {
    signal: CancelSignal,
}

impl CancelSource {
    /// Create a pending signal with a fresh identity
    pub fn new() -> Self {
        Self {
            signal: CancelSignal {
                id: SignalId(NEXT_SIGNAL_ID.fetch_add(1, Ordering::Relaxed)),
                token: CancellationToken::new(),
            },
        }
    }

    /// Hand out a subscriber view of this source's signal
    pub fn signal(&self) -> CancelSignal {
        self.signal.clone()
    }

    /// Transition to cancelled; later calls have no effect
    pub fn cancel(&self) {
        self.signal.token.cancel();
    }

    /// Whether [`cancel`](Self::cancel) has been called
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscriber side of a cancellation signal
#[derive(Debug, Clone)]
pub struct CancelSignal {
    id: SignalId,
    token: CancellationToken,
}

impl CancelSignal {
    /// Identity used as the memoization key
    pub fn id(&self) -> SignalId {
        self.id
    }

    /// Whether the signal is in the cancelled state
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once the signal is cancelled (immediately if it already is)
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

impl PartialEq for CancelSignal {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CancelSignal {}

impl Hash for CancelSignal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
