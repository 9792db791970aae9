// Copyright (c) 2024 Scheduler Infra Team
// Licensed and distributed under either of
//   * MIT license (license terms in the root directory or at http://opensource.org/licenses/MIT).
//   * Apache v2 license (license terms in the root directory or at http://www.apache.org/licenses/LICENSE-2.0).
// at your option. This file may not be copied, modified, or distributed except according to those terms.

//! The change-notification bus (spec.md §4.1).
//!
//! One [`Bus<E>`] backs each of the five entity-kind channels
//! (`ModifiedTasksCh`, `ModifiedJobsCh`, the three comment channels).
//! Subscribers never block producers: `publish` only ever takes a
//! subscriber's mailbox lock to merge entities into a per-id map, which
//! is O(batch size) and never awaits I/O. A subscriber that falls too
//! far behind — either by pending-entity count or by wall-clock time
//! since its last drain — is dropped and sent [`BusEvent::StreamLost`]
//! before its channel closes, per spec.md §5 "Backpressure".

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tracing::{debug, warn};

use crate::ids::Id;
use crate::model::Identified;

pub use crate::error::BusError;

/// A batch delivered to a subscriber, or the sentinel that precedes a
/// dropped channel.
#[derive(Debug)]
pub enum BusEvent<E> {
    /// The first send on every new subscription is a batch — a live
    /// snapshot or an empty placeholder, per spec.md §4.1. Every batch
    /// after that contains what changed since the subscriber's last
    /// drain.
    Batch(Vec<E>),
    /// Delivered once, immediately before the channel closes, when the
    /// subscriber lagged past the configured high-water mark.
    StreamLost,
}

struct Mailbox<E> {
    pending: AsyncMutex<HashMap<Id, E>>,
    notify: Notify,
    last_drain: AsyncMutex<Instant>,
    dropped: AtomicBool,
}

/// A live subscription. Dropping it unregisters from the bus and
/// closes the channel promptly (spec.md §5 "Cancellation").
pub struct Subscription<E: Identified> {
    key: u64,
    bus: Bus<E>,
    mailbox: Arc<Mailbox<E>>,
    sentinel_sent: bool,
    snapshot_sent: bool,
}

impl<E: Identified> Subscription<E> {
    /// Waits for and returns the next batch. The very first call
    /// returns the initial snapshot (possibly empty) without waiting
    /// for a real change, per spec.md §4.1.
    pub async fn recv(&mut self) -> Option<BusEvent<E>> {
        if self.sentinel_sent {
            return None;
        }
        if !self.snapshot_sent {
            self.snapshot_sent = true;
            let mut pending = self.mailbox.pending.lock().await;
            let batch: Vec<E> = pending.drain().map(|(_, v)| v).collect();
            *self.mailbox.last_drain.lock().await = Instant::now();
            return Some(BusEvent::Batch(batch));
        }

        loop {
            if self.mailbox.dropped.load(Ordering::Acquire) {
                self.sentinel_sent = true;
                return Some(BusEvent::StreamLost);
            }
            {
                let mut pending = self.mailbox.pending.lock().await;
                if !pending.is_empty() {
                    let batch: Vec<E> = pending.drain().map(|(_, v)| v).collect();
                    *self.mailbox.last_drain.lock().await = Instant::now();
                    return Some(BusEvent::Batch(batch));
                }
            }
            self.mailbox.notify.notified().await;
        }
    }
}

impl<E: Identified> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.key);
    }
}

struct BusInner<E: Identified> {
    mailboxes: DashMap<u64, Arc<Mailbox<E>>>,
    next_key: AtomicU64,
    high_water_mark: usize,
    lag_timeout: Duration,
    max_subscribers: usize,
}

/// Multiplexes writes made to one entity kind out to every live
/// subscriber, independent of the other four entity kinds (spec.md
/// §4.1, last paragraph).
pub struct Bus<E: Identified> {
    inner: Arc<BusInner<E>>,
}

impl<E: Identified> Clone for Bus<E> {
    fn clone(&self) -> Self {
        Bus {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Identified> Bus<E> {
    pub fn new(high_water_mark: usize, lag_timeout: Duration) -> Self {
        Bus {
            inner: Arc::new(BusInner {
                mailboxes: DashMap::new(),
                next_key: AtomicU64::new(0),
                high_water_mark,
                lag_timeout,
                max_subscribers: 1024,
            }),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.mailboxes.len()
    }

    /// Opens a new subscription. The subscriber's first `recv()` yields
    /// the snapshot passed here (pass an empty `Vec` for "no live
    /// snapshot available").
    pub fn subscribe(
        &self,
        snapshot: Vec<E>,
    ) -> Result<Subscription<E>, crate::error::BusError> {
        if self.inner.mailboxes.len() >= self.inner.max_subscribers {
            return Err(crate::error::BusError::TooManyUsers);
        }
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        let mailbox = Arc::new(Mailbox {
            pending: AsyncMutex::new(snapshot.into_iter().map(|e| (e.id(), e)).collect()),
            notify: Notify::new(),
            last_drain: AsyncMutex::new(Instant::now()),
            dropped: AtomicBool::new(false),
        });
        self.inner.mailboxes.insert(key, mailbox.clone());
        Ok(Subscription {
            key,
            bus: self.clone(),
            mailbox,
            sentinel_sent: false,
            snapshot_sent: false,
        })
    }

    fn unsubscribe(&self, key: u64) {
        self.inner.mailboxes.remove(&key);
    }

    /// Fans a batch of changed entities out to every live subscriber,
    /// coalescing per-id into each subscriber's mailbox so producers
    /// never block on a slow consumer (spec.md §5 "Backpressure").
    pub async fn publish(&self, entities: Vec<E>) {
        if entities.is_empty() {
            return;
        }
        let mut dead = Vec::new();
        for entry in self.inner.mailboxes.iter() {
            let key = *entry.key();
            let mailbox = entry.value().clone();

            let lagged_too_long = {
                let last_drain = mailbox.last_drain.lock().await;
                last_drain.elapsed() > self.inner.lag_timeout
            };

            let mut pending = mailbox.pending.lock().await;
            for e in &entities {
                pending.insert(e.id(), e.clone());
            }
            let over_water_mark = pending.len() > self.inner.high_water_mark;
            drop(pending);

            if lagged_too_long || over_water_mark {
                warn!(subscriber = key, "dropping lagging bus subscriber");
                mailbox.dropped.store(true, Ordering::Release);
                dead.push(key);
            }
            mailbox.notify.notify_one();
        }
        for key in dead {
            // Leave the mailbox registered until the subscriber observes
            // `StreamLost` on its next `recv`; `unsubscribe` still runs
            // when the `Subscription` is dropped.
            debug!(subscriber = key, "subscriber marked dropped");
        }
    }
}
