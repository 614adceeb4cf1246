//! Per-worker flow control.
//!
//! A worker must take a permit before it enqueues an upward request; the
//! supervisor hands the permit back (a `permit` frame) once the request has
//! been serviced, successful or not. The number of permits therefore bounds the
//! upward requests in flight for one worker. One permit gives strict lockstep,
//! two keep the UI pipeline busy without queueing stale work.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::ProtocolError;

pub const DEFAULT_PERMITS: usize = 2;

#[derive(Debug)]
struct FlowState {
    available: usize,
    peak_in_flight: usize,
    closed: bool,
}

/// Counting semaphore guarding one worker's upward queue.
#[derive(Debug)]
pub struct FlowControl {
    capacity: usize,
    state: Mutex<FlowState>,
    freed: Condvar,
}

impl FlowControl {
    /// A capacity of zero is raised to one: a worker with no permits could never talk.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(FlowState {
                available: capacity,
                peak_in_flight: 0,
                closed: false,
            }),
            freed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until a permit is free.
    pub fn acquire(&self) -> Result<(), ProtocolError> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(ProtocolError::Closed);
            }
            if state.available > 0 {
                self.take(&mut state);
                return Ok(());
            }
            state = self.freed.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`; returns whether a permit was taken.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<bool, ProtocolError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(ProtocolError::Closed);
            }
            if state.available > 0 {
                self.take(&mut state);
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            state = self
                .freed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn take(&self, state: &mut FlowState) {
        state.available -= 1;
        let in_flight = self.capacity - state.available;
        state.peak_in_flight = state.peak_in_flight.max(in_flight);
    }

    pub fn release(&self) {
        let mut state = self.lock();
        if state.available >= self.capacity {
            warn!("flow control: permit released with none outstanding");
            return;
        }
        state.available += 1;
        drop(state);
        self.freed.notify_one();
    }

    /// Fails every current and future acquire. Used when the counterpart is gone.
    pub fn close(&self) {
        self.lock().closed = true;
        self.freed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.lock().available
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.lock().available
    }

    /// Highest number of simultaneously outstanding permits seen so far.
    pub fn peak_in_flight(&self) -> usize {
        self.lock().peak_in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let flow = FlowControl::new(0);
        assert_eq!(flow.capacity(), 1);
        assert_eq!(flow.available(), 1);
    }

    #[test]
    fn acquire_blocks_until_release() {
        let flow = Arc::new(FlowControl::new(1));
        flow.acquire().unwrap();
        assert!(!flow.acquire_timeout(Duration::from_millis(20)).unwrap());

        let releaser = {
            let flow = flow.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                flow.release();
            })
        };
        flow.acquire().unwrap();
        releaser.join().unwrap();
        flow.release();
        assert_eq!(flow.available(), 1);
        assert_eq!(flow.peak_in_flight(), 1);
    }

    #[test]
    fn over_release_is_ignored() {
        let flow = FlowControl::new(2);
        flow.release();
        assert_eq!(flow.available(), 2);
    }

    #[test]
    fn close_wakes_waiters() {
        let flow = Arc::new(FlowControl::new(1));
        flow.acquire().unwrap();
        let waiter = {
            let flow = flow.clone();
            thread::spawn(move || flow.acquire())
        };
        thread::sleep(Duration::from_millis(20));
        flow.close();
        assert!(matches!(waiter.join().unwrap(), Err(ProtocolError::Closed)));
    }

    #[test]
    fn peak_tracks_concurrent_permits() {
        let flow = FlowControl::new(3);
        flow.acquire().unwrap();
        flow.acquire().unwrap();
        flow.release();
        flow.acquire().unwrap();
        assert_eq!(flow.peak_in_flight(), 2);
        assert_eq!(flow.in_flight(), 2);
    }
}
