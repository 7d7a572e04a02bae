use crate::error::ReactorError;
use crate::reactor::Reactor;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

type PopFn<T> = Box<dyn FnOnce(&Reactor, T) + Send>;

/// FIFO queue feeding values into a reactor loop.
///
/// `push` is safe from any thread; `pop` consumers always run on the loop
/// thread. Values and consumers pair up first-in-first-out regardless of
/// which side arrived first.
pub struct Queue<T> {
    reactor: Reactor,
    inner: Arc<Mutex<Inner<T>>>,
}

struct Inner<T> {
    items: VecDeque<T>,
    waiters: VecDeque<PopFn<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Queue {
            reactor: self.reactor.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Queue<T> {
    pub(crate) fn new(reactor: Reactor) -> Self {
        Queue {
            reactor,
            inner: Arc::new(Mutex::new(Inner {
                items: VecDeque::new(),
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Appends a value. If a consumer is already waiting, delivery is
    /// scheduled onto the loop thread, which requires an active loop.
    pub fn push(&self, value: T) -> Result<(), ReactorError> {
        let waiter = {
            let mut inner = self.inner.lock().unwrap();
            match inner.waiters.pop_front() {
                Some(waiter) => waiter,
                None => {
                    inner.items.push_back(value);
                    return Ok(());
                }
            }
        };
        self.reactor.schedule(move |reactor| waiter(reactor, value))
    }

    /// Registers a consumer for the next value. If a value is already
    /// queued, delivery is scheduled onto the loop thread right away.
    pub fn pop<F>(&self, callback: F) -> Result<(), ReactorError>
    where
        F: FnOnce(&Reactor, T) + Send + 'static,
    {
        let value = {
            let mut inner = self.inner.lock().unwrap();
            match inner.items.pop_front() {
                Some(value) => value,
                None => {
                    inner.waiters.push_back(Box::new(callback));
                    return Ok(());
                }
            }
        };
        self.reactor.schedule(move |reactor| callback(reactor, value))
    }

    /// Number of values waiting for a consumer.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
