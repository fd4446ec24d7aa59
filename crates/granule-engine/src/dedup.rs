//! Duplicate detection for confirmable messages
//!
//! A bounded-lifetime mapping `KeyId -> Exchange`. `find_previous` is the
//! duplicate-detection primitive: atomically insert-if-absent and return
//! the previous occupant, if any.
//!
//! Three strategies behind one interface:
//! - `Noop` always reports "not seen"
//! - `MarkAndSweep` (default) inserts on first sight and evicts entries
//!   older than the exchange lifetime on a periodic sweep
//! - `CropRotation` keeps three generations; insertion targets the
//!   youngest, lookup scans all three, rotation drops the oldest wholesale

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::{Config, DeduplicatorMode};
use crate::exchange::Exchange;
use crate::keys::KeyId;

struct Entry {
    exchange: Arc<Exchange>,
    inserted: Instant,
}

/// Tagged variant over the three concrete strategies
pub enum Deduplicator {
    Noop,
    MarkAndSweep {
        entries: DashMap<KeyId, Entry>,
        lifetime: Duration,
    },
    CropRotation {
        /// Oldest generation at the front, youngest at the back.
        /// Replaced under the write lock only; readers see a consistent
        /// snapshot.
        generations: RwLock<VecDeque<DashMap<KeyId, Arc<Exchange>>>>,
    },
}

impl Deduplicator {
    pub fn from_config(config: &Config) -> Self {
        match config.deduplicator {
            DeduplicatorMode::Noop => Deduplicator::Noop,
            DeduplicatorMode::MarkAndSweep => Deduplicator::MarkAndSweep {
                entries: DashMap::new(),
                lifetime: config.exchange_lifetime,
            },
            DeduplicatorMode::CropRotation => {
                let mut generations = VecDeque::with_capacity(3);
                for _ in 0..3 {
                    generations.push_back(DashMap::new());
                }
                Deduplicator::CropRotation {
                    generations: RwLock::new(generations),
                }
            }
        }
    }

    /// Insert `exchange` under `key` if absent and return `None`; return
    /// the existing exchange (without replacing it) otherwise.
    pub fn find_previous(&self, key: KeyId, exchange: &Arc<Exchange>) -> Option<Arc<Exchange>> {
        match self {
            Deduplicator::Noop => None,
            Deduplicator::MarkAndSweep { entries, .. } => {
                match entries.entry(key) {
                    dashmap::mapref::entry::Entry::Occupied(occupied) => {
                        Some(occupied.get().exchange.clone())
                    }
                    dashmap::mapref::entry::Entry::Vacant(vacant) => {
                        vacant.insert(Entry {
                            exchange: exchange.clone(),
                            inserted: Instant::now(),
                        });
                        None
                    }
                }
            }
            Deduplicator::CropRotation { generations } => {
                let generations = generations.read();
                for generation in generations.iter() {
                    if let Some(existing) = generation.get(&key) {
                        return Some(existing.clone());
                    }
                }
                // youngest generation is at the back; entry() keeps the
                // insert-or-return atomic under racing receivers
                if let Some(youngest) = generations.back() {
                    match youngest.entry(key) {
                        dashmap::mapref::entry::Entry::Occupied(occupied) => {
                            return Some(occupied.get().clone());
                        }
                        dashmap::mapref::entry::Entry::Vacant(vacant) => {
                            vacant.insert(exchange.clone());
                        }
                    }
                }
                None
            }
        }
    }

    /// Lookup without inserting
    pub fn find(&self, key: &KeyId) -> Option<Arc<Exchange>> {
        match self {
            Deduplicator::Noop => None,
            Deduplicator::MarkAndSweep { entries, .. } => {
                entries.get(key).map(|e| e.exchange.clone())
            }
            Deduplicator::CropRotation { generations } => generations
                .read()
                .iter()
                .find_map(|generation| generation.get(key).map(|e| e.clone())),
        }
    }

    /// Periodic maintenance: sweep expired entries (mark-and-sweep) or
    /// rotate generations (crop rotation). No-op for `Noop`.
    pub fn maintain(&self) {
        match self {
            Deduplicator::Noop => {}
            Deduplicator::MarkAndSweep { entries, lifetime } => {
                let before = entries.len();
                entries.retain(|_, entry| entry.inserted.elapsed() <= *lifetime);
                let evicted = before - entries.len();
                if evicted > 0 {
                    debug!("dedup sweep evicted {} entries", evicted);
                }
            }
            Deduplicator::CropRotation { generations } => {
                let mut generations = generations.write();
                let dropped = generations.pop_front().map(|g| g.len()).unwrap_or(0);
                generations.push_back(DashMap::new());
                if dropped > 0 {
                    debug!("dedup rotation dropped {} entries", dropped);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Deduplicator::Noop => 0,
            Deduplicator::MarkAndSweep { entries, .. } => entries.len(),
            Deduplicator::CropRotation { generations } => {
                generations.read().iter().map(|g| g.len()).sum()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Origin;
    use granule_transport::SessionId;
    use std::net::SocketAddr;

    fn exchange() -> Arc<Exchange> {
        let addr: SocketAddr = "127.0.0.1:5683".parse().unwrap();
        Arc::new(Exchange::new(Origin::Remote, addr, SessionId::new()))
    }

    fn key(mid: u16, session: SessionId) -> KeyId {
        KeyId::remote(mid, "127.0.0.1:40000".parse().unwrap(), session)
    }

    #[test]
    fn test_noop_never_sees() {
        let dedup = Deduplicator::from_config(
            &Config::default().with_deduplicator(DeduplicatorMode::Noop),
        );
        let session = SessionId::new();
        let ex = exchange();
        assert!(dedup.find_previous(key(1, session), &ex).is_none());
        assert!(dedup.find_previous(key(1, session), &ex).is_none());
    }

    #[test]
    fn test_mark_and_sweep_detects_duplicate() {
        let dedup = Deduplicator::from_config(&Config::default());
        let session = SessionId::new();
        let first = exchange();
        let second = exchange();

        assert!(dedup.find_previous(key(1, session), &first).is_none());
        let previous = dedup.find_previous(key(1, session), &second).unwrap();
        assert!(Arc::ptr_eq(&previous, &first));
        // the second exchange must not have replaced the first
        assert!(Arc::ptr_eq(&dedup.find(&key(1, session)).unwrap(), &first));
    }

    #[test]
    fn test_mark_and_sweep_evicts_after_lifetime() {
        let config = Config::default().with_exchange_lifetime(Duration::from_millis(0));
        let dedup = Deduplicator::from_config(&config);
        let session = SessionId::new();
        let ex = exchange();

        assert!(dedup.find_previous(key(1, session), &ex).is_none());
        std::thread::sleep(Duration::from_millis(5));
        dedup.maintain();
        assert!(dedup.is_empty());
        assert!(dedup.find_previous(key(1, session), &ex).is_none());
    }

    #[test]
    fn test_crop_rotation_survives_two_rotations() {
        let config = Config::default().with_deduplicator(DeduplicatorMode::CropRotation);
        let dedup = Deduplicator::from_config(&config);
        let session = SessionId::new();
        let ex = exchange();

        assert!(dedup.find_previous(key(1, session), &ex).is_none());
        dedup.maintain();
        dedup.maintain();
        // entry sits in the oldest generation now but is still found
        assert!(dedup.find_previous(key(1, session), &ex).is_some());
        // third rotation drops the generation it lives in
        let fresh = Deduplicator::from_config(&config);
        assert!(fresh.find_previous(key(2, session), &ex).is_none());
        fresh.maintain();
        fresh.maintain();
        fresh.maintain();
        assert!(fresh.find_previous(key(2, session), &ex).is_none());
    }
}
