//! Typed, buffering event logging shared by the sigflow runtime.
//!
//! A [`Registry`] binds stream names to actions on batches of timestamped
//! events. Components hold cheap [`Logger`] clones and push events; each
//! logger buffers and hands full batches (or explicit flushes) to the
//! installed action together with a timestamp that lower-bounds any event
//! still to come. Loggers are shared across scheduler threads, so the
//! buffer lives behind a mutex and actions must be `Send + Sync`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Events a batch action receives: `(elapsed-at-log, event)`.
pub type LogBatch<T> = [(Duration, T)];

/// A map from names to typed loggers.
pub struct Registry {
    /// An instant common to all logging statements.
    time: Instant,
    map: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl Registry {
    /// Creates a new logger registry.
    pub fn new(time: Instant) -> Self {
        Registry { time, map: Mutex::new(HashMap::new()) }
    }

    /// Binds a log name to an action on batches of events.
    ///
    /// Returns any pre-installed logger rather than overwriting it; loggers
    /// already handed out keep writing to the old destination.
    pub fn insert<T: Send + 'static>(
        &self,
        name: &str,
        action: Box<dyn Fn(&Duration, &LogBatch<T>) + Send + Sync>,
    ) -> Option<Box<dyn Any + Send + Sync>> {
        let logger = Logger::<T>::new(self.time, action);
        self.map.lock().unwrap().insert(name.to_owned(), Box::new(logger))
    }

    /// Removes a bound logger, ending its stream.
    pub fn remove(&self, name: &str) -> Option<Box<dyn Any + Send + Sync>> {
        self.map.lock().unwrap().remove(name)
    }

    /// Retrieves a shared logger, if one has been inserted.
    pub fn get<T: Send + 'static>(&self, name: &str) -> Option<Logger<T>> {
        self.map
            .lock()
            .unwrap()
            .get(name)
            .and_then(|entry| entry.downcast_ref::<Logger<T>>())
            .cloned()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new(Instant::now())
    }
}

type Action<T> = dyn Fn(&Duration, &LogBatch<T>) + Send + Sync;

/// A buffering logger.
pub struct Logger<T> {
    time: Instant,
    action: Arc<Action<T>>,
    buffer: Arc<Mutex<Vec<(Duration, T)>>>,
}

impl<T> Clone for Logger<T> {
    fn clone(&self) -> Self {
        Logger {
            time: self.time,
            action: Arc::clone(&self.action),
            buffer: Arc::clone(&self.buffer),
        }
    }
}

impl<T> Logger<T> {
    /// Allocates a new shareable logger bound to a write destination.
    pub fn new(time: Instant, action: Box<Action<T>>) -> Self {
        Logger {
            time,
            action: Arc::from(action),
            buffer: Arc::new(Mutex::new(Vec::with_capacity(1024))),
        }
    }

    /// Logs an event.
    ///
    /// The timestamp is recorded at the moment of logging; delivery may be
    /// delayed until the buffer fills or someone flushes.
    pub fn log(&self, event: T) {
        let mut buffer = self.buffer.lock().unwrap();
        buffer.push((self.time.elapsed(), event));
        if buffer.len() == buffer.capacity() {
            (self.action)(&self.time.elapsed(), &buffer[..]);
            buffer.clear();
        }
    }

    /// Flushes buffered events and communicates the new minimal timestamp.
    pub fn flush(&self) {
        let mut buffer = self.buffer.lock().unwrap();
        (self.action)(&self.time.elapsed(), &buffer[..]);
        buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_log_flush() {
        let registry = Registry::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.insert::<u64>(
            "events",
            Box::new(move |_lower, batch| {
                sink.lock().unwrap().extend(batch.iter().map(|(_, e)| *e));
            }),
        );

        let logger = registry.get::<u64>("events").unwrap();
        logger.log(3);
        logger.log(5);
        assert!(seen.lock().unwrap().is_empty());
        logger.flush();
        assert_eq!(*seen.lock().unwrap(), vec![3, 5]);
    }

    #[test]
    fn typed_lookup_misses() {
        let registry = Registry::default();
        registry.insert::<u64>("events", Box::new(|_, _| {}));
        assert!(registry.get::<String>("events").is_none());
        assert!(registry.get::<u64>("absent").is_none());
    }

    #[test]
    fn loggers_share_a_stream_across_threads() {
        let registry = Registry::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.insert::<usize>(
            "events",
            Box::new(move |_lower, batch| {
                sink.lock().unwrap().extend(batch.iter().map(|(_, e)| *e));
            }),
        );

        let logger = registry.get::<usize>("events").unwrap();
        let handles: Vec<_> = (0..4)
            .map(|index| {
                let logger = logger.clone();
                std::thread::spawn(move || logger.log(index))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        logger.flush();

        let mut events = seen.lock().unwrap().clone();
        events.sort();
        assert_eq!(events, vec![0, 1, 2, 3]);
    }
}
