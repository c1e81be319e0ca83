//! Event tokens for the device dependency graph
//!
//! Every enqueued command yields an event; tools chain work by passing
//! events in wait lists. **User events** are completed from host code and
//! bridge asynchronous host work (message passing, host computation) into
//! the device event graph.
//!
//! States move monotonically through `Queued → Submitted → Running →
//! Complete | Error`; a backward transition is silently ignored.
//! Reference counting is the `Arc` clone/drop of the token itself.

use crate::error::{BackendError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Execution status of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// Command sits in the host queue
    Queued,
    /// Command was handed to the device
    Submitted,
    /// Command is executing
    Running,
    /// Command finished successfully
    Complete,
    /// Command finished with a negative status code
    Error(i32),
}

impl EventStatus {
    /// Whether the status is terminal (`Complete` or `Error`)
    pub fn is_terminal(self) -> bool {
        matches!(self, EventStatus::Complete | EventStatus::Error(_))
    }

    fn rank(self) -> u8 {
        match self {
            EventStatus::Queued => 0,
            EventStatus::Submitted => 1,
            EventStatus::Running => 2,
            EventStatus::Complete | EventStatus::Error(_) => 3,
        }
    }
}

type Callback = Box<dyn FnOnce(EventStatus) + Send>;

struct EventInner {
    state: Mutex<EventStatus>,
    cond: Condvar,
    callbacks: Mutex<Vec<Callback>>,
    user: bool,
}

/// Shared event token
///
/// Cloning shares the token; equality of identity can be checked with
/// [`Event::same`] and [`Event::id`] (used to de-duplicate wait lists).
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub(crate) fn queued() -> Self {
        Self::with_state(EventStatus::Queued, false)
    }

    /// Create a user event, to be completed explicitly by host code
    pub fn user() -> Self {
        Self::with_state(EventStatus::Submitted, true)
    }

    fn with_state(state: EventStatus, user: bool) -> Self {
        Self {
            inner: Arc::new(EventInner {
                state: Mutex::new(state),
                cond: Condvar::new(),
                callbacks: Mutex::new(Vec::new()),
                user,
            }),
        }
    }

    /// Whether this is a user event
    pub fn is_user(&self) -> bool {
        self.inner.user
    }

    /// Current status
    pub fn status(&self) -> EventStatus {
        *self.inner.state.lock()
    }

    /// Identity of the token, stable across clones
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Whether two tokens denote the same event
    pub fn same(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Advance the event state. Backward transitions are ignored.
    ///
    /// A terminal transition wakes waiters and fires the registered
    /// callbacks on a detached callback thread, in registration order.
    pub(crate) fn transition(&self, status: EventStatus) {
        {
            let mut state = self.inner.state.lock();
            if state.is_terminal() || status.rank() <= state.rank() {
                return;
            }
            *state = status;
        }
        if status.is_terminal() {
            self.inner.cond.notify_all();
            let callbacks = std::mem::take(&mut *self.inner.callbacks.lock());
            if !callbacks.is_empty() {
                std::thread::spawn(move || {
                    for callback in callbacks {
                        callback(status);
                    }
                });
            }
        }
    }

    /// Mark the event complete. Only meaningful for user events and the
    /// queue worker.
    pub fn complete(&self) {
        self.transition(EventStatus::Complete);
    }

    /// Mark the event failed with a negative status code
    pub fn fail(&self, code: i32) {
        self.transition(EventStatus::Error(code));
    }

    /// Copy another event's terminal status onto this one
    pub fn finish_as(&self, status: EventStatus) {
        match status {
            EventStatus::Error(code) => self.fail(code),
            _ => self.complete(),
        }
    }

    /// Block until the event reaches a terminal state
    pub fn wait(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        while !state.is_terminal() {
            self.inner.cond.wait(&mut state);
        }
        match *state {
            EventStatus::Error(code) => Err(BackendError::EventError(code)),
            _ => Ok(()),
        }
    }

    /// Register a completion callback
    ///
    /// The callback runs on a detached callback thread once the event is
    /// terminal; registering on an already terminal event fires it
    /// immediately (still off the caller's thread).
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(EventStatus) + Send + 'static,
    {
        let status = {
            let state = self.inner.state.lock();
            if !state.is_terminal() {
                // Registration happens under the state lock so a racing
                // terminal transition cannot miss the callback.
                self.inner.callbacks.lock().push(Box::new(callback));
                return;
            }
            *state
        };
        std::thread::spawn(move || callback(status));
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id())
            .field("status", &self.status())
            .field("user", &self.inner.user)
            .finish()
    }
}

/// Drop duplicate tokens from a wait list, keeping first occurrences
pub fn dedup_events(events: &mut Vec<Event>) {
    let mut seen = Vec::with_capacity(events.len());
    events.retain(|event| {
        if seen.contains(&event.id()) {
            false
        } else {
            seen.push(event.id());
            true
        }
    });
}

/// Wait for every event in the list, surfacing the first error
pub fn wait_all(events: &[Event]) -> Result<()> {
    for event in events {
        event.wait()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_user_event_completion() {
        let event = Event::user();
        assert!(event.is_user());
        assert_eq!(event.status(), EventStatus::Submitted);

        let waiter = {
            let event = event.clone();
            std::thread::spawn(move || event.wait())
        };
        std::thread::sleep(Duration::from_millis(10));
        event.complete();
        waiter.join().unwrap().unwrap();
        assert_eq!(event.status(), EventStatus::Complete);
    }

    #[test]
    fn test_error_status_propagates_to_waiters() {
        let event = Event::user();
        event.fail(-36);
        match event.wait() {
            Err(BackendError::EventError(code)) => assert_eq!(code, -36),
            other => panic!("expected event error, got {other:?}"),
        }
    }

    #[test]
    fn test_monotonic_transitions() {
        let event = Event::queued();
        event.transition(EventStatus::Running);
        event.transition(EventStatus::Submitted);
        assert_eq!(event.status(), EventStatus::Running);
        event.complete();
        event.fail(-1);
        assert_eq!(event.status(), EventStatus::Complete);
    }

    #[test]
    fn test_callback_fires_on_completion() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        let event = Event::user();
        event.on_complete(|status| {
            assert_eq!(status, EventStatus::Complete);
            FIRED.fetch_add(1, Ordering::SeqCst);
        });
        event.complete();
        // Callback registered after completion fires as well.
        event.on_complete(|_| {
            FIRED.fetch_add(1, Ordering::SeqCst);
        });
        for _ in 0..100 {
            if FIRED.load(Ordering::SeqCst) == 2 {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("callbacks did not fire");
    }

    #[test]
    fn test_dedup_events() {
        let a = Event::user();
        let b = Event::user();
        let mut list = vec![a.clone(), b.clone(), a.clone()];
        dedup_events(&mut list);
        assert_eq!(list.len(), 2);
        assert!(list[0].same(&a));
        assert!(list[1].same(&b));
    }
}
