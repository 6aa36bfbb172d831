//! Lazily evaluated, memoized payloads.

use crate::error::AutogradError;
use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::rc::Rc;

/// Deferred computation of a payload.
pub type Producer<D> = Rc<dyn Fn() -> Result<D, AutogradError>>;

struct Memo<D> {
    producer: Producer<D>,
    cache: RefCell<Option<D>>,
}

/// Wraps a producer and caches its result after the first evaluation.
///
/// Clones share the same cache. Replacing the payload of a value always
/// installs a fresh holder, so memoization never outlives its producer.
///
/// # Example
///
/// ```
/// use ndgrad::LazyPayload;
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let calls = Rc::new(Cell::new(0));
/// let counter = Rc::clone(&calls);
/// let payload = LazyPayload::from_fn(move || {
///     counter.set(counter.get() + 1);
///     Ok(42.0_f64)
/// });
///
/// assert_eq!(payload.get().unwrap(), 42.0);
/// assert_eq!(payload.get().unwrap(), 42.0);
/// assert_eq!(calls.get(), 1);
/// ```
pub struct LazyPayload<D> {
    inner: Rc<Memo<D>>,
}

impl<D: Clone + 'static> LazyPayload<D> {
    /// Wrap an existing producer.
    pub fn new(producer: Producer<D>) -> Self {
        Self {
            inner: Rc::new(Memo {
                producer,
                cache: RefCell::new(None),
            }),
        }
    }

    /// Wrap a closure.
    pub fn from_fn(f: impl Fn() -> Result<D, AutogradError> + 'static) -> Self {
        Self::new(Rc::new(f))
    }

    /// Holder for an already computed payload.
    pub fn ready(value: D) -> Self {
        let cached = value.clone();
        let payload = Self::from_fn(move || Ok(value.clone()));
        *payload.inner.cache.borrow_mut() = Some(cached);
        payload
    }

    /// Evaluate the producer on first call, then return the cached value.
    pub fn get(&self) -> Result<D, AutogradError> {
        if let Some(value) = self.inner.cache.borrow().as_ref() {
            return Ok(value.clone());
        }
        let value = (self.inner.producer)()?;
        *self.inner.cache.borrow_mut() = Some(value.clone());
        Ok(value)
    }

    /// Drop the cached value; the next `get` re-runs the producer.
    pub fn clear_cache(&self) {
        self.inner.cache.borrow_mut().take();
    }

    /// Whether a value is currently cached.
    pub fn is_cached(&self) -> bool {
        self.inner.cache.borrow().is_some()
    }

    /// Whether both holders share the same cache.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<D> Clone for LazyPayload<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<D: Debug> Debug for LazyPayload<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyPayload")
            .field("cached", &self.inner.cache.borrow())
            .finish()
    }
}
