//! One-shot quorum counter.
//!
//! Completions arrive from independently spawned RPC tasks, so the tallies
//! sit behind a mutex and the callback is taken out exactly once.

use std::sync::Mutex;

type Callback = Box<dyn FnOnce(bool) + Send>;

struct Tally {
    succeeded: usize,
    failed: usize,
    callback: Option<Callback>,
}

pub struct Quorum {
    required: usize,
    participants: usize,
    tally: Mutex<Tally>,
}

impl Quorum {
    /// Creates a counter that needs `required` successes out of
    /// `participants` votes.
    ///
    /// Fires immediately when the outcome is already decided: `true` if
    /// nothing is required, `false` if there are fewer participants than
    /// required successes.
    pub fn new(
        required: usize,
        participants: usize,
        callback: impl FnOnce(bool) + Send + 'static,
    ) -> Self {
        let quorum = Self {
            required,
            participants,
            tally: Mutex::new(Tally {
                succeeded: 0,
                failed: 0,
                callback: Some(Box::new(callback)),
            }),
        };
        quorum.record(|_| {});
        quorum
    }

    pub fn succeed(&self) {
        self.record(|t| t.succeeded += 1);
    }

    pub fn fail(&self) {
        self.record(|t| t.failed += 1);
    }

    /// Whether the callback has already fired.
    pub fn is_complete(&self) -> bool {
        match self.tally.lock() {
            Ok(tally) => tally.callback.is_none(),
            Err(poisoned) => poisoned.into_inner().callback.is_none(),
        }
    }

    fn record(&self, update: impl FnOnce(&mut Tally)) {
        let fired = {
            let mut tally = match self.tally.lock() {
                Ok(tally) => tally,
                Err(poisoned) => poisoned.into_inner(),
            };
            if tally.callback.is_none() {
                return;
            }
            update(&mut tally);

            let outcome = if tally.succeeded >= self.required {
                Some(true)
            } else if tally.failed > self.participants.saturating_sub(self.required) {
                Some(false)
            } else {
                None
            };
            outcome.and_then(|ok| tally.callback.take().map(|cb| (cb, ok)))
        };

        // Run the callback outside the lock so it may touch other counters.
        if let Some((callback, ok)) = fired {
            callback(ok);
        }
    }
}

impl std::fmt::Debug for Quorum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Quorum")
            .field("required", &self.required)
            .field("participants", &self.participants)
            .field("complete", &self.is_complete())
            .finish()
    }
}
