//! Values that may change while a container is running.
//!
//! Brokers and retrievers re-read their properties on every scheduling
//! decision, so a [`Dynamic`] backed by a function must be cheap. Use
//! [`Dynamic::cached`] when the underlying lookup is expensive (feature flags,
//! remote configuration).

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A value that is either fixed or re-evaluated each time it is read.
pub struct Dynamic<T> {
    source: Source<T>,
}

enum Source<T> {
    Fixed(T),
    Function(Arc<dyn Fn() -> T + Send + Sync>),
}

impl<T> Dynamic<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn fixed(value: T) -> Self {
        Dynamic {
            source: Source::Fixed(value),
        }
    }

    /// Evaluates `supplier` on every read.
    pub fn from_fn<F>(supplier: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Dynamic {
            source: Source::Function(Arc::new(supplier)),
        }
    }

    /// Evaluates `supplier` at most once per `time_to_live`, serving the cached
    /// value in between.
    pub fn cached<F>(time_to_live: Duration, supplier: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let cache: Mutex<Option<(Instant, T)>> = Mutex::new(None);
        Dynamic::from_fn(move || {
            let mut cache = match cache.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some((loaded_at, value)) = cache.as_ref() {
                if loaded_at.elapsed() < time_to_live {
                    return value.clone();
                }
            }
            let value = supplier();
            *cache = Some((Instant::now(), value.clone()));
            value
        })
    }

    pub fn get(&self) -> T {
        match &self.source {
            Source::Fixed(value) => value.clone(),
            Source::Function(supplier) => supplier(),
        }
    }
}

impl<T: Clone> Clone for Dynamic<T> {
    fn clone(&self) -> Self {
        let source = match &self.source {
            Source::Fixed(value) => Source::Fixed(value.clone()),
            Source::Function(supplier) => Source::Function(Arc::clone(supplier)),
        };
        Dynamic { source }
    }
}

impl<T: fmt::Debug> fmt::Debug for Dynamic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Source::Fixed(value) => f.debug_tuple("Dynamic::Fixed").field(value).finish(),
            Source::Function(_) => f.write_str("Dynamic::Function(..)"),
        }
    }
}

impl<T> From<T> for Dynamic<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn from(value: T) -> Self {
        Dynamic::fixed(value)
    }
}
