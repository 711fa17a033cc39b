//! Cooperative execution control.
//!
//! Every engine call carries a [`TaskControl`] token. Cancel and pause
//! are flags the engine checks at its suspension points (file boundaries,
//! retry backoffs, progress publishes); tape-change acknowledgments and
//! completion travel over channels attached to the same token.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{bail, Error};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use tba_api_types::Id;

/// Operator acknowledgment of a tape change request.
#[derive(Clone, Debug)]
pub struct TapeChangeAck {
    pub request_id: Id,
    pub new_tape_id: Id,
}

#[derive(Default)]
struct ControlFlags {
    cancelled: bool,
    paused: bool,
}

struct ControlInner {
    flags: Mutex<ControlFlags>,
    changed: Condvar,
    tape_change_tx: Sender<TapeChangeAck>,
    tape_change_rx: Receiver<TapeChangeAck>,
    done_tx: Sender<()>,
    done_rx: Receiver<()>,
}

/// Cancellation/pause token shared between supervisor and engine.
#[derive(Clone)]
pub struct TaskControl {
    inner: Arc<ControlInner>,
}

/// Outcome of waiting at a pause point.
#[derive(Debug, PartialEq, Eq)]
pub enum PauseOutcome {
    Resumed,
    Cancelled,
}

impl Default for TaskControl {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskControl {
    pub fn new() -> Self {
        let (tape_change_tx, tape_change_rx) = unbounded();
        let (done_tx, done_rx) = bounded(1);
        Self {
            inner: Arc::new(ControlInner {
                flags: Mutex::new(ControlFlags::default()),
                changed: Condvar::new(),
                tape_change_tx,
                tape_change_rx,
                done_tx,
                done_rx,
            }),
        }
    }

    fn flags(&self) -> std::sync::MutexGuard<'_, ControlFlags> {
        self.inner
            .flags
            .lock()
            .unwrap_or_else(|err| err.into_inner())
    }

    /// Request cooperative cancellation. Idempotent.
    pub fn cancel(&self) {
        let mut flags = self.flags();
        flags.cancelled = true;
        self.inner.changed.notify_all();
    }

    /// Request a pause at the next file boundary. Idempotent.
    pub fn pause(&self) {
        let mut flags = self.flags();
        flags.paused = true;
        self.inner.changed.notify_all();
    }

    /// Clear a pause. Idempotent.
    pub fn resume(&self) {
        let mut flags = self.flags();
        flags.paused = false;
        self.inner.changed.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flags().cancelled
    }

    pub fn is_paused(&self) -> bool {
        self.flags().paused
    }

    /// Fail with `Cancelled` if cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            bail!("task cancelled");
        }
        Ok(())
    }

    /// Block while paused. Returns how the wait ended.
    pub fn wait_while_paused(&self) -> PauseOutcome {
        let mut flags = self.flags();
        loop {
            if flags.cancelled {
                return PauseOutcome::Cancelled;
            }
            if !flags.paused {
                return PauseOutcome::Resumed;
            }
            flags = self
                .inner
                .changed
                .wait(flags)
                .unwrap_or_else(|err| err.into_inner());
        }
    }

    /// Interruptible sleep for retry backoffs; returns false when
    /// cancelled during the wait.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = std::time::Instant::now() + duration;
        let mut flags = self.flags();
        loop {
            if flags.cancelled {
                return false;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return true;
            }
            let (guard, _timeout) = self
                .inner
                .changed
                .wait_timeout(flags, deadline - now)
                .unwrap_or_else(|err| err.into_inner());
            flags = guard;
        }
    }

    /// Deliver a tape-change acknowledgment to the waiting engine.
    pub fn acknowledge_tape_change(&self, ack: TapeChangeAck) {
        let _ = self.inner.tape_change_tx.send(ack);
    }

    /// Wait for a tape-change acknowledgment, polling the cancel flag.
    pub fn wait_tape_change(&self) -> Result<TapeChangeAck, Error> {
        loop {
            self.check_cancelled()?;
            match self
                .inner
                .tape_change_rx
                .recv_timeout(Duration::from_millis(250))
            {
                Ok(ack) => return Ok(ack),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    bail!("tape change channel closed")
                }
            }
        }
    }

    /// Signal completion to whoever waits on the token.
    pub fn mark_done(&self) {
        let _ = self.inner.done_tx.try_send(());
    }

    /// Wait for the execution to finish.
    pub fn wait_done(&self, timeout: Duration) -> bool {
        self.inner.done_rx.recv_timeout(timeout).is_ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signals_are_idempotent() {
        let control = TaskControl::new();
        control.pause();
        control.pause();
        assert!(control.is_paused());
        control.resume();
        control.resume();
        assert!(!control.is_paused());
        control.cancel();
        control.cancel();
        assert!(control.is_cancelled());
    }

    #[test]
    fn cancel_interrupts_pause_wait() {
        let control = TaskControl::new();
        control.pause();

        let waiter = control.clone();
        let handle = std::thread::spawn(move || waiter.wait_while_paused());

        std::thread::sleep(Duration::from_millis(50));
        control.cancel();
        assert_eq!(handle.join().unwrap(), PauseOutcome::Cancelled);
    }

    #[test]
    fn cancel_interrupts_backoff_sleep() {
        let control = TaskControl::new();
        let sleeper = control.clone();
        let handle = std::thread::spawn(move || sleeper.sleep(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(50));
        control.cancel();
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn tape_change_ack_reaches_waiter() {
        let control = TaskControl::new();
        let waiter = control.clone();
        let handle = std::thread::spawn(move || waiter.wait_tape_change().unwrap());
        control.acknowledge_tape_change(TapeChangeAck {
            request_id: 7,
            new_tape_id: 3,
        });
        let ack = handle.join().unwrap();
        assert_eq!(ack.request_id, 7);
        assert_eq!(ack.new_tape_id, 3);
    }
}
