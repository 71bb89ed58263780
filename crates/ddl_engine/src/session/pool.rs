//! Bounded pool of reusable execution contexts.

use std::sync::Mutex;

use crate::error::{DdlError, DdlResult};

/// A pooled resource. `close` releases whatever the resource holds and must
/// tolerate being called on a resource that was never used.
pub trait Resource: Send {
    fn close(&mut self);
}

type Factory<R> = Box<dyn Fn() -> DdlResult<R> + Send + Sync>;

struct PoolInner<R> {
    idle: Vec<R>,
    closed: bool,
}

/// Keeps at most `capacity` idle resources.
///
/// `get` hands out an idle resource or builds a fresh one, so it never
/// blocks; `capacity` bounds retention, not concurrency. After `close`,
/// `get` fails with `PoolClosed` and returned resources are closed instead
/// of retained.
pub struct SessionPool<R: Resource> {
    capacity: usize,
    factory: Factory<R>,
    inner: Mutex<PoolInner<R>>,
}

impl<R: Resource> SessionPool<R> {
    pub fn new(
        capacity: usize,
        factory: impl Fn() -> DdlResult<R> + Send + Sync + 'static,
    ) -> Self {
        Self {
            capacity,
            factory: Box::new(factory),
            inner: Mutex::new(PoolInner {
                idle: Vec::with_capacity(capacity),
                closed: false,
            }),
        }
    }

    pub fn get(&self) -> DdlResult<R> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(DdlError::PoolClosed);
            }
            if let Some(resource) = inner.idle.pop() {
                return Ok(resource);
            }
        }
        (self.factory)()
    }

    /// Returns a resource. Closes it instead when the pool is full or closed.
    pub fn put(&self, mut resource: R) {
        let mut inner = self.lock();
        if inner.closed || inner.idle.len() >= self.capacity {
            drop(inner);
            resource.close();
            return;
        }
        inner.idle.push(resource);
    }

    /// Closes every idle resource. Idempotent.
    pub fn close(&self) {
        let idle = {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            std::mem::take(&mut inner.idle)
        };
        for mut resource in idle {
            resource.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn idle_len(&self) -> usize {
        self.lock().idle.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner<R>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    struct CountingResource {
        id: usize,
        closed: Arc<AtomicUsize>,
    }

    impl Resource for CountingResource {
        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(capacity: usize) -> (SessionPool<CountingResource>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let factory_created = Arc::clone(&created);
        let factory_closed = Arc::clone(&closed);
        let pool = SessionPool::new(capacity, move || {
            let id = factory_created.fetch_add(1, Ordering::SeqCst);
            Ok(CountingResource {
                id,
                closed: Arc::clone(&factory_closed),
            })
        });
        (pool, created, closed)
    }

    #[test]
    fn capacity_one_lifecycle() {
        let (pool, created, closed) = pool(1);

        let first = pool.get().expect("first get");
        let second = pool.get().expect("second get");
        assert_eq!(created.load(Ordering::SeqCst), 2);

        pool.put(first);
        // Pool is full; this one is closed immediately.
        pool.put(second);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_len(), 1);

        let reused = pool.get().expect("reuse idle");
        assert_eq!(reused.id, 0);
        assert_eq!(created.load(Ordering::SeqCst), 2);
        pool.put(reused);

        pool.close();
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_len(), 0);

        let err = pool.get().err().expect("closed pool must refuse");
        assert_eq!(err.to_string(), "session pool closed");

        let late = CountingResource {
            id: 99,
            closed: Arc::clone(&closed),
        };
        pool.put(late);
        assert_eq!(closed.load(Ordering::SeqCst), 3);

        // Closing twice is harmless.
        pool.close();
        assert!(pool.is_closed());
    }

    #[test]
    fn factory_errors_are_propagated() {
        let pool: SessionPool<CountingResource> =
            SessionPool::new(2, || Err(DdlError::internal("no sessions today")));
        let err = pool.get().err().expect("factory failure");
        assert_eq!(err.to_string(), "no sessions today");
    }
}
