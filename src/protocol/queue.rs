use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::debug;
use thiserror::Error;

use super::Request;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("request queue is closed")]
pub struct QueueClosed;

/// Unbounded FIFO of requests shared between a producer and its consumers.
///
/// Cloning produces another handle to the same queue. `push` never blocks; `pop`
/// blocks until a request is available or the queue is closed. Requests pushed
/// before [`RequestQueue::close`] are still handed out afterwards.
#[derive(Debug, Clone, Default)]
pub struct RequestQueue {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    available: Condvar,
}

#[derive(Debug, Default)]
struct State {
    items: VecDeque<Request>,
    closed: bool,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, request: Request) {
        let mut state = self.lock();
        if state.closed {
            debug!("discarding '{}' pushed to a closed queue", request.command());
            return;
        }
        state.items.push_back(request);
        drop(state);
        self.shared.available.notify_one();
    }

    pub fn pop(&self) -> Result<Request, QueueClosed> {
        let state = self.lock();
        let mut state = self
            .shared
            .available
            .wait_while(state, |s| s.items.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        state.items.pop_front().ok_or(QueueClosed)
    }

    /// Like [`RequestQueue::pop`], giving up with `Ok(None)` after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<Request>, QueueClosed> {
        let state = self.lock();
        let (mut state, _) = self
            .shared
            .available
            .wait_timeout_while(state, timeout, |s| s.items.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);

        match state.items.pop_front() {
            Some(request) => Ok(Some(request)),
            None if state.closed => Err(QueueClosed),
            None => Ok(None),
        }
    }

    pub fn try_pop(&self) -> Option<Request> {
        self.lock().items.pop_front()
    }

    /// Take every queued request in FIFO order without blocking.
    pub fn drain(&self) -> Vec<Request> {
        self.lock().items.drain(..).collect()
    }

    /// Wake all waiting consumers; they receive what is left, then [`QueueClosed`].
    pub fn close(&self) {
        self.lock().closed = true;
        self.shared.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn fifo_order() {
        let queue = RequestQueue::new();
        queue.push(Request::get("a"));
        queue.push(Request::get("b"));
        queue.push(Request::get("c"));

        assert_eq!(queue.len(), 3);
        for key in ["a", "b", "c"] {
            assert_eq!(queue.pop().unwrap().str_at(0), Some(key));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_waits_for_producer() {
        let queue = RequestQueue::new();
        let producer = queue.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            producer.push(Request::ping());
        });

        assert_eq!(queue.pop().unwrap(), Request::ping());
        handle.join().unwrap();
    }

    #[test]
    fn close_wakes_consumer() {
        let queue = RequestQueue::new();
        let consumer = queue.clone();

        let handle = thread::spawn(move || consumer.pop());
        thread::sleep(Duration::from_millis(50));
        queue.close();

        assert_eq!(handle.join().unwrap(), Err(QueueClosed));
    }

    #[test]
    fn close_drains_remaining_items_first() {
        let queue = RequestQueue::new();
        queue.push(Request::ping());
        queue.close();
        queue.push(Request::pong());

        assert_eq!(queue.pop().unwrap(), Request::ping());
        assert_eq!(queue.pop(), Err(QueueClosed));
        assert!(queue.is_closed());
    }

    #[test]
    fn pop_timeout_and_try_pop() {
        let queue = RequestQueue::new();
        assert_eq!(queue.pop_timeout(Duration::from_millis(10)), Ok(None));
        assert_eq!(queue.try_pop(), None);

        queue.push(Request::get("a"));
        queue.push(Request::get("b"));
        assert_eq!(queue.pop_timeout(Duration::from_millis(10)).unwrap(), Some(Request::get("a")));
        assert_eq!(queue.drain(), vec![Request::get("b")]);

        queue.close();
        assert_eq!(queue.pop_timeout(Duration::from_millis(10)), Err(QueueClosed));
    }
}
