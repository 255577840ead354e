//! Single-Flight Coordination
//!
//! Collapses concurrent work for the same key into one execution whose
//! outcome is delivered to every waiter.
//!
//! # Design
//!
//! ```text
//!   caller A ──┐                       ┌──▶ result (Leader)
//!   caller B ──┼──▶ slot[key] ──▶ Shared<future> ──▶ result (Follower)
//!   caller C ──┘                       └──▶ result (Follower)
//! ```
//!
//! - The slot map holds only a weak handle. Waiters hold the strong ones,
//!   so the work is dropped once nobody is waiting for it.
//! - The work releases its own slot before completing; a caller arriving
//!   afterwards starts a fresh flight.
//! - Errors fan out like values and are never remembered.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;

use crate::error::{Error, Result};

type Flight<T> = Shared<BoxFuture<'static, Result<T>>>;

struct Slot<T> {
    generation: u64,
    flight: WeakShared<BoxFuture<'static, Result<T>>>,
}

type Slots<K, T> = Arc<Mutex<HashMap<K, Slot<T>>>>;

/// Whether a caller started the work or joined it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    Leader,
    Follower,
}

/// Per-key deduplication of in-flight work
pub struct SingleFlight<K, T> {
    slots: Slots<K, T>,
    next_generation: AtomicU64,
}

impl<K, T> Default for SingleFlight<K, T> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Unpin + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys with live work
    pub fn in_flight(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.flight.upgrade().is_some())
            .count()
    }

    /// Run `work` for `key`, or join the execution already running for it.
    ///
    /// `work` is only invoked by the leader, and must be cheap to call: it
    /// runs under the slot lock and should just build the future.
    pub async fn run<F>(&self, key: K, work: F) -> (Result<T>, FlightRole)
    where
        F: FnOnce() -> BoxFuture<'static, Result<T>>,
    {
        let (waiter, role) = {
            let mut slots = self.slots.lock();
            let live = slots
                .get(&key)
                .and_then(|slot| Some((slot.generation, slot.flight.upgrade()?)));

            match live {
                Some((generation, flight)) => (
                    Waiter::new(flight, Arc::clone(&self.slots), key, generation),
                    FlightRole::Follower,
                ),
                None => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let flight = Self::launch(Arc::clone(&self.slots), key.clone(), generation, work());
                    if let Some(weak) = flight.downgrade() {
                        slots.insert(key.clone(), Slot { generation, flight: weak });
                    }
                    (
                        Waiter::new(flight, Arc::clone(&self.slots), key, generation),
                        FlightRole::Leader,
                    )
                }
            }
        };

        (waiter.await, role)
    }

    fn launch(
        slots: Slots<K, T>,
        key: K,
        generation: u64,
        work: BoxFuture<'static, Result<T>>,
    ) -> Flight<T> {
        async move {
            let result = work.await;
            {
                let mut slots = slots.lock();
                if slots.get(&key).map(|s| s.generation) == Some(generation) {
                    slots.remove(&key);
                }
            }
            result
        }
        .boxed()
        .shared()
    }
}

/// One caller's handle on a flight.
///
/// On drop it releases its strong reference and, if that abandons the
/// flight, clears the slot so the next caller starts over.
struct Waiter<K: Eq + Hash, T> {
    flight: Option<Flight<T>>,
    slots: Slots<K, T>,
    key: K,
    generation: u64,
}

impl<K: Eq + Hash, T> Waiter<K, T> {
    fn new(flight: Flight<T>, slots: Slots<K, T>, key: K, generation: u64) -> Self {
        Self {
            flight: Some(flight),
            slots,
            key,
            generation,
        }
    }
}

impl<K, T> Future for Waiter<K, T>
where
    K: Eq + Hash + Unpin,
    T: Clone,
{
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.flight.as_mut() {
            Some(flight) => Pin::new(flight).poll(cx),
            None => Poll::Ready(Err(Error::Internal(
                "single-flight waiter polled after release".to_string(),
            ))),
        }
    }
}

impl<K: Eq + Hash, T> Drop for Waiter<K, T> {
    fn drop(&mut self) {
        // release ours first so upgrade() sees only the other waiters
        drop(self.flight.take());

        let mut slots = self.slots.lock();
        let abandoned = slots
            .get(&self.key)
            .map(|s| s.generation == self.generation && s.flight.upgrade().is_none())
            .unwrap_or(false);
        if abandoned {
            slots.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn counting_work(
        calls: Arc<AtomicUsize>,
        gate: Arc<Notify>,
        value: u32,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<u32>> {
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                Ok(value)
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let flights: Arc<SingleFlight<u64, u32>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let mut handles = Vec::new();
        for _ in 0..20 {
            let flights = Arc::clone(&flights);
            let work = counting_work(Arc::clone(&calls), Arc::clone(&gate), 7);
            handles.push(tokio::spawn(async move { flights.run(1, work).await }));
        }

        // let every task register before releasing the work
        while flights.in_flight() == 0 || calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_waiters();

        let mut leaders = 0;
        for handle in handles {
            let (result, role) = handle.await.unwrap();
            assert_eq!(result.unwrap(), 7);
            if role == FlightRole::Leader {
                leaders += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let flights: SingleFlight<u64, u32> = SingleFlight::new();
        let (a, role_a) = flights.run(1, || async { Ok::<u32, Error>(1) }.boxed()).await;
        let (b, role_b) = flights.run(2, || async { Ok::<u32, Error>(2) }.boxed()).await;
        assert_eq!((a.unwrap(), b.unwrap()), (1, 2));
        assert_eq!((role_a, role_b), (FlightRole::Leader, FlightRole::Leader));
    }

    #[tokio::test]
    async fn test_errors_are_shared_but_not_remembered() {
        let flights: SingleFlight<u64, u32> = SingleFlight::new();
        let (first, _) = flights
            .run(1, || async { Err::<u32, Error>(Error::compute_failed("test", "boom")) }.boxed())
            .await;
        assert_eq!(first, Err(Error::compute_failed("test", "boom")));

        let (second, role) = flights.run(1, || async { Ok::<u32, Error>(5) }.boxed()).await;
        assert_eq!(second, Ok(5));
        assert_eq!(role, FlightRole::Leader);
    }

    #[tokio::test]
    async fn test_leader_cancellation_keeps_work_alive_for_followers() {
        let flights: Arc<SingleFlight<u64, u32>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let leader = {
            let flights = Arc::clone(&flights);
            let work = counting_work(Arc::clone(&calls), Arc::clone(&gate), 11);
            tokio::spawn(async move { flights.run(9, work).await })
        };
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let follower = {
            let flights = Arc::clone(&flights);
            let work = counting_work(Arc::clone(&calls), Arc::clone(&gate), 99);
            tokio::spawn(async move { flights.run(9, work).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        leader.abort();
        let _ = leader.await;
        assert_eq!(flights.in_flight(), 1);

        gate.notify_waiters();
        let (result, role) = follower.await.unwrap();
        assert_eq!(result.unwrap(), 11);
        assert_eq!(role, FlightRole::Follower);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_work_is_dropped() {
        let flights: Arc<SingleFlight<u64, u32>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let lone = {
            let flights = Arc::clone(&flights);
            let work = counting_work(Arc::clone(&calls), Arc::clone(&gate), 1);
            tokio::spawn(async move { flights.run(3, work).await })
        };
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        lone.abort();
        let _ = lone.await;

        assert_eq!(flights.in_flight(), 0);
        assert!(flights.slots.lock().is_empty());

        // the next caller starts fresh
        let (result, role) = flights.run(3, || async { Ok::<u32, Error>(2) }.boxed()).await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(role, FlightRole::Leader);
    }
}
