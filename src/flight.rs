//! single-flight computation cache
//!
//! concurrent callers asking for the same key share one computation. a
//! finished value is served until its ttl runs out or the caller's
//! generation moves past the one it was computed for.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, ErrorKind, Result};

/// cooperative cancellation flag
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once cancelled
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

type Shared<V> = std::result::Result<V, (ErrorKind, String)>;

struct Flight<V> {
    token: CancelToken,
    generation: u64,
    outcome: Mutex<Option<Shared<V>>>,
    done: Condvar,
}

impl<V: Clone> Flight<V> {
    fn new(generation: u64) -> Self {
        Self {
            token: CancelToken::new(),
            generation,
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn complete(&self, outcome: Shared<V>) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.done.notify_all();
    }

    fn wait(&self) -> Result<V> {
        let mut slot = self.outcome.lock();
        loop {
            match slot.as_ref() {
                Some(Ok(value)) => return Ok(value.clone()),
                Some(Err((kind, message))) => return Err(Error::shared(*kind, message.clone())),
                None => self.done.wait(&mut slot),
            }
        }
    }
}

enum Slot<V> {
    Running(Arc<Flight<V>>),
    Ready {
        value: V,
        at: Instant,
        generation: u64,
    },
}

/// keyed single-flight cache with ttl and generation invalidation
pub struct SingleFlight<K, V> {
    ttl: Duration,
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> SingleFlight<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// cached value for `key`, or the result of one shared `compute` run
    pub fn get<F>(&self, key: &K, generation: u64, compute: F) -> Result<V>
    where
        F: FnOnce(&CancelToken) -> Result<V>,
    {
        let flight = {
            let mut slots = self.slots.lock();
            match slots.get(key) {
                Some(Slot::Ready {
                    value,
                    at,
                    generation: g,
                }) if *g == generation && at.elapsed() < self.ttl => return Ok(value.clone()),
                Some(Slot::Running(flight)) if flight.generation == generation => {
                    let flight = flight.clone();
                    drop(slots);
                    return flight.wait();
                }
                _ => {}
            }
            let flight = Arc::new(Flight::new(generation));
            slots.insert(key.clone(), Slot::Running(flight.clone()));
            flight
        };

        let mut landing = Landing {
            cache: self,
            key,
            flight: &flight,
            landed: false,
        };
        let result = compute(&flight.token);
        landing.land(result)
    }

    /// cancel the computation running for `key`, if any
    pub fn cancel(&self, key: &K) -> bool {
        match self.slots.lock().get(key) {
            Some(Slot::Running(flight)) => {
                flight.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// drop cached values; running computations are left alone
    pub fn invalidate(&self, key: Option<&K>) {
        let mut slots = self.slots.lock();
        match key {
            Some(key) => {
                if matches!(slots.get(key), Some(Slot::Ready { .. })) {
                    slots.remove(key);
                }
            }
            None => slots.retain(|_, slot| matches!(slot, Slot::Running(_))),
        }
    }
}

/// publishes a flight's outcome, also when the computation unwinds
struct Landing<'a, K: Eq + Hash + Clone, V: Clone> {
    cache: &'a SingleFlight<K, V>,
    key: &'a K,
    flight: &'a Arc<Flight<V>>,
    landed: bool,
}

impl<K: Eq + Hash + Clone, V: Clone> Landing<'_, K, V> {
    fn land(&mut self, result: Result<V>) -> Result<V> {
        self.landed = true;
        let result = {
            let mut slots = self.cache.slots.lock();
            // a cancel that found this flight running wins over its result
            let result = match result {
                Ok(_) if self.flight.token.is_cancelled() => Err(Error::Cancelled),
                other => other,
            };
            let ours = matches!(
                slots.get(self.key),
                Some(Slot::Running(f)) if Arc::ptr_eq(f, self.flight)
            );
            if ours {
                match &result {
                    Ok(value) => {
                        slots.insert(
                            self.key.clone(),
                            Slot::Ready {
                                value: value.clone(),
                                at: Instant::now(),
                                generation: self.flight.generation,
                            },
                        );
                    }
                    Err(_) => {
                        slots.remove(self.key);
                    }
                }
            }
            result
        };
        self.flight.complete(match &result {
            Ok(value) => Ok(value.clone()),
            Err(e) => Err((e.kind(), e.to_string())),
        });
        result
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Drop for Landing<'_, K, V> {
    fn drop(&mut self) {
        if !self.landed {
            let _ = self.land(Err(Error::IllegalState(
                "shared computation aborted".to_string(),
            )));
        }
    }
}
