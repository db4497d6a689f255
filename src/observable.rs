use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifies a registered observer for later removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A keyed value that notifies observers whenever it is replaced.
///
/// Observers run synchronously on the thread calling [`set`](Self::set),
/// in registration order, after the new value is visible to [`get`](Self::get).
pub struct Observable<T> {
    key: String,
    value: RwLock<T>,
    observers: Mutex<Vec<(ObserverId, Observer<T>)>>,
    next_id: AtomicU64,
}

impl<T: fmt::Debug> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("key", &self.key)
            .field("value", &*self.value.read())
            .field("observers", &self.observers.lock().len())
            .finish()
    }
}

impl<T: Clone> Observable<T> {
    /// Create with an initial value; nobody is notified of it
    pub fn new(key: impl Into<String>, initial: T) -> Self {
        Self {
            key: key.into(),
            value: RwLock::new(initial),
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current value
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Replace the value and notify every observer
    pub fn set(&self, value: T) {
        *self.value.write() = value.clone();

        // Observers may register or remove observers themselves
        let observers: Vec<Observer<T>> = self.observers.lock().iter().map(|(_, f)| f.clone()).collect();
        for observer in observers {
            observer(&value);
        }
    }

    /// Register an observer for future changes
    pub fn observe(&self, observer: impl Fn(&T) + Send + Sync + 'static) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, Arc::new(observer)));
        id
    }

    /// Remove an observer; returns whether it was registered
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_value_not_notified() {
        let observable = Observable::new("k", 1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        observable.observe(move |v: &i32| sink.lock().push(*v));

        assert_eq!(observable.get(), 1);
        assert!(seen.lock().is_empty());

        observable.set(2);
        observable.set(3);
        assert_eq!(*seen.lock(), vec![2, 3]);
        assert_eq!(observable.key(), "k");
    }

    #[test]
    fn test_value_visible_inside_observer() {
        let observable = Arc::new(Observable::new("k", 0));
        let inner = observable.clone();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        observable.observe(move |_: &i32| *sink.lock() = Some(inner.get()));

        observable.set(7);
        assert_eq!(*seen.lock(), Some(7));
    }

    #[test]
    fn test_remove_observer() {
        let observable = Observable::new("k", 0);
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let id = observable.observe(move |_: &i32| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        observable.set(1);
        assert!(observable.remove_observer(id));
        assert!(!observable.remove_observer(id));
        observable.set(2);

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(observable.observer_count(), 0);
    }
}
