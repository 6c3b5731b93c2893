use std::{
    cell::UnsafeCell,
    collections::BTreeMap,
    fmt,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use log::{debug, trace};
use semaphore::Mutex;

use crate::subscriber::{Channel, Subscriber};

struct Registry<T> {
    // ids only grow, so key order is subscription order
    subscribers: BTreeMap<u64, Arc<Channel<T>>>,
    next_id: u64,
}

/// Fans every published item out to all current subscribers.
///
/// Each subscriber owns a ring of `slots_per_subscriber` items guarded by its
/// own pair of semaphores, so a slow reader only ever holds back the
/// publisher, never another reader's view of the stream.
pub struct BroadcastQueue<T> {
    slots_per_subscriber: usize,
    // never closed; see `registry()`
    mutex: Mutex,
    registry: UnsafeCell<Registry<T>>,
}

// The registry is only reached through `RegistryGuard`, which holds `mutex`.
unsafe impl<T: Send> Send for BroadcastQueue<T> {}
unsafe impl<T: Send> Sync for BroadcastQueue<T> {}

struct RegistryGuard<'a, T> {
    queue: &'a BroadcastQueue<T>,
}

impl<T> Deref for RegistryGuard<'_, T> {
    type Target = Registry<T>;
    fn deref(&self) -> &Registry<T> {
        unsafe { &*self.queue.registry.get() }
    }
}

impl<T> DerefMut for RegistryGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Registry<T> {
        unsafe { &mut *self.queue.registry.get() }
    }
}

impl<T> Drop for RegistryGuard<'_, T> {
    fn drop(&mut self) {
        self.queue.mutex.leave();
    }
}

impl<T> BroadcastQueue<T> {
    /// Creates an empty queue. Every subscriber gets a ring of
    /// `slots_per_subscriber` items, at least one.
    pub fn new(slots_per_subscriber: usize) -> Self {
        Self {
            slots_per_subscriber: slots_per_subscriber.max(1),
            mutex: Mutex::new("broadcast-registry"),
            registry: UnsafeCell::new(Registry {
                subscribers: BTreeMap::new(),
                next_id: 0,
            }),
        }
    }

    fn registry(&self) -> RegistryGuard<'_, T> {
        if !self.mutex.enter() {
            panic!("broadcast registry mutex closed");
        }
        RegistryGuard { queue: self }
    }

    /// Registers a new subscriber. It receives every item whose publish
    /// starts after this returns.
    pub fn subscribe(&self) -> Subscriber<T> {
        let mut registry = self.registry();
        let id = registry.next_id;
        registry.next_id += 1;

        let channel = Arc::new(Channel::new(id, self.slots_per_subscriber));
        registry.subscribers.insert(id, channel.clone());
        let count = registry.subscribers.len();
        drop(registry);

        debug!("broadcast: subscriber {id} joined ({count} active)");
        Subscriber::new(channel)
    }

    /// Unregisters `subscriber` and discards whatever is still buffered for
    /// it. A reader parked on it wakes up with `None`.
    ///
    /// Returns `false` if the subscriber was already closed or belongs to
    /// another queue.
    pub fn close(&self, subscriber: &Subscriber<T>) -> bool {
        let id = subscriber.id();
        let mut registry = self.registry();
        let registered = registry
            .subscribers
            .get(&id)
            .is_some_and(|channel| Arc::ptr_eq(channel, &subscriber.channel));
        if registered {
            registry.subscribers.remove(&id);
        }
        let count = registry.subscribers.len();
        drop(registry);

        if !registered {
            trace!("broadcast: subscriber {id} not registered, close ignored");
            return false;
        }
        subscriber.channel.close();
        debug!("broadcast: subscriber {id} left ({count} active)");
        true
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.registry().subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slots_per_subscriber(&self) -> usize {
        self.slots_per_subscriber
    }

    /// Ids of registered subscribers in delivery order.
    pub fn subscriber_ids(&self) -> Vec<u64> {
        self.registry().subscribers.keys().copied().collect()
    }
}

impl<T: Clone> BroadcastQueue<T> {
    /// Delivers `item` to every subscriber registered when the call starts,
    /// in subscription order, and returns how many received it.
    ///
    /// Parks on each full subscriber in turn, which also holds back every
    /// subscriber after it. Subscribers joining meanwhile miss this item.
    /// Subscribers closed meanwhile are skipped, including one this call is
    /// parked on.
    pub fn publish(&self, item: T) -> usize {
        let targets: Vec<_> = self.registry().subscribers.values().cloned().collect();
        let Some((last, rest)) = targets.split_last() else {
            trace!("broadcast: no subscribers, item dropped");
            return 0;
        };

        let mut delivered = 0;
        for channel in rest {
            delivered += usize::from(Self::deliver(channel, item.clone()));
        }
        delivered += usize::from(Self::deliver(last, item));
        delivered
    }

    fn deliver(channel: &Channel<T>, item: T) -> bool {
        if channel.is_closed() || !channel.deliver(item) {
            trace!("broadcast: subscriber {} closed, skipped", channel.id());
            return false;
        }
        true
    }
}

impl<T> Drop for BroadcastQueue<T> {
    fn drop(&mut self) {
        let registry = self.registry.get_mut();
        for channel in registry.subscribers.values() {
            channel.close();
        }
        registry.subscribers.clear();
    }
}

impl<T> fmt::Debug for BroadcastQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastQueue")
            .field("slots_per_subscriber", &self.slots_per_subscriber)
            .field("subscribers", &self.subscriber_ids())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::{thread, time::Duration};

    use crossbeam_channel::bounded;
    use rand::Rng;

    use super::BroadcastQueue;
    use crate::testing::{assert_parked, init_logger, RELEASED};

    #[test]
    fn publish_without_subscribers() {
        let queue = BroadcastQueue::new(4);
        assert!(queue.is_empty());
        assert_eq!(queue.publish(1), 0);
    }

    #[test]
    fn clamps_slots() {
        let queue = BroadcastQueue::<u8>::new(0);
        assert_eq!(queue.slots_per_subscriber(), 1);
        assert_eq!(queue.subscribe().capacity(), 1);
    }

    #[test]
    fn every_subscriber_sees_every_item() {
        init_logger();
        const ITEMS: u32 = 500;
        let queue = BroadcastQueue::new(8);
        let subscribers: Vec<_> = (0..5).map(|_| queue.subscribe()).collect();

        thread::scope(|s| {
            let readers: Vec<_> = subscribers
                .iter()
                .enumerate()
                .map(|(index, sub)| {
                    s.spawn(move || {
                        let mut rng = rand::thread_rng();
                        let mut seen = Vec::new();
                        for _ in 0..ITEMS {
                            // reader 0 runs flat out, the rest dawdle
                            if index > 0 && rng.gen_ratio(1, 10) {
                                thread::sleep(Duration::from_micros(rng.gen_range(0..500)));
                            }
                            let (item, _) = sub.read().unwrap();
                            seen.push(item);
                        }
                        seen
                    })
                })
                .collect();

            for item in 0..ITEMS {
                assert_eq!(queue.publish(item), 5);
            }

            for reader in readers {
                assert_eq!(reader.join().unwrap(), (0..ITEMS).collect::<Vec<_>>());
            }
        });
    }

    #[test]
    fn full_subscriber_holds_back_publish() {
        let queue = BroadcastQueue::new(2);
        let a = queue.subscribe();
        assert_eq!(queue.publish(10), 1);
        assert_eq!(queue.publish(20), 1);
        assert_eq!(a.buffered(), 2);

        let (tx, rx) = bounded(1);
        thread::scope(|s| {
            let publisher = s.spawn(|| tx.send(queue.publish(30)).unwrap());

            assert_parked(&rx);
            assert_eq!(a.read(), Some((10, 0)));
            assert_eq!(rx.recv_timeout(RELEASED), Ok(1));
            publisher.join().unwrap();
        });

        assert_eq!(a.read(), Some((20, 1)));
        assert_eq!(a.read(), Some((30, 0)));
    }

    #[test]
    fn slow_subscriber_delays_later_ones() {
        let queue = BroadcastQueue::new(1);
        let a = queue.subscribe();
        let b = queue.subscribe();
        assert_eq!(queue.publish(1), 2);
        assert_eq!(b.read(), Some((1, 0)));

        let (tx, rx) = bounded(1);
        thread::scope(|s| {
            let publisher = s.spawn(|| tx.send(queue.publish(2)).unwrap());

            assert_parked(&rx);
            // b has room but sits behind a
            assert_eq!(b.try_read(), None);

            assert_eq!(a.read(), Some((1, 0)));
            assert_eq!(rx.recv_timeout(RELEASED), Ok(2));
            publisher.join().unwrap();
        });

        assert_eq!(a.read(), Some((2, 0)));
        assert_eq!(b.read(), Some((2, 0)));
    }

    #[test]
    fn late_subscriber_starts_at_subscription() {
        let queue = BroadcastQueue::new(8);
        let early = queue.subscribe();
        for item in 1..=3 {
            queue.publish(item);
        }

        let late = queue.subscribe();
        assert_eq!(late.try_read(), None);
        for item in 4..=5 {
            assert_eq!(queue.publish(item), 2);
        }

        let early_seen: Vec<_> = (0..4).map(|_| early.read().unwrap().0).collect();
        assert_eq!(early_seen, [1, 2, 3, 4]);
        assert_eq!(early.read(), Some((5, 4)));
        assert_eq!(late.read(), Some((4, 0)));
        assert_eq!(late.read(), Some((5, 1)));
    }

    #[test]
    fn subscriber_joining_mid_publish_misses_item() {
        let queue = BroadcastQueue::new(1);
        let a = queue.subscribe();
        queue.publish(1);

        let (tx, rx) = bounded(1);
        let late = thread::scope(|s| {
            let publisher = s.spawn(|| tx.send(queue.publish(2)).unwrap());
            assert_parked(&rx);

            let late = queue.subscribe();
            assert_eq!(a.read(), Some((1, 0)));
            assert_eq!(rx.recv_timeout(RELEASED), Ok(1));
            publisher.join().unwrap();
            late
        });

        assert_eq!(late.try_read(), None);
        assert_eq!(a.read(), Some((2, 0)));
        assert_eq!(queue.publish(3), 2);
        assert_eq!(a.read(), Some((3, 0)));
        assert_eq!(late.read(), Some((3, 0)));
    }

    #[test]
    fn close_unregisters() {
        init_logger();
        let queue = BroadcastQueue::new(2);
        let a = queue.subscribe();
        let b = queue.subscribe();
        let c = queue.subscribe();
        assert_eq!(queue.subscriber_ids(), [0, 1, 2]);

        queue.publish("kept");
        assert!(queue.close(&b));
        assert!(!queue.close(&b));
        assert!(b.is_closed());
        assert_eq!(b.read(), None);

        assert_eq!(queue.subscriber_ids(), [0, 2]);
        assert_eq!(queue.publish("after"), 2);

        // ids are not handed out twice
        let d = queue.subscribe();
        assert_eq!(d.id(), 3);
        assert_eq!(queue.len(), 3);

        assert_eq!(a.read(), Some(("kept", 0)));
        assert_eq!(a.read(), Some(("after", 1)));
        assert_eq!(c.read(), Some(("kept", 0)));
        assert_eq!(c.read(), Some(("after", 1)));
    }

    #[test]
    fn close_ignores_foreign_subscriber() {
        let queue = BroadcastQueue::<u8>::new(1);
        let other = BroadcastQueue::<u8>::new(1);
        let ours = queue.subscribe();
        let theirs = other.subscribe();
        assert_eq!(ours.id(), theirs.id());

        assert!(!queue.close(&theirs));
        assert!(!theirs.is_closed());
        assert_eq!(queue.len(), 1);
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn close_wakes_parked_reader() {
        init_logger();
        let queue = BroadcastQueue::<u64>::new(2);
        let sub = queue.subscribe();

        let (tx, rx) = bounded(1);
        thread::scope(|s| {
            let reader = s.spawn(|| tx.send(sub.read()).unwrap());

            assert_parked(&rx);
            assert!(queue.close(&sub));
            assert_eq!(rx.recv_timeout(RELEASED), Ok(None));
            reader.join().unwrap();
        });
    }

    #[test]
    fn close_releases_parked_publisher() {
        let queue = BroadcastQueue::new(1);
        let stuck = queue.subscribe();
        let live = queue.subscribe();
        queue.publish(1);
        assert_eq!(live.read(), Some((1, 0)));

        let (tx, rx) = bounded(1);
        thread::scope(|s| {
            let publisher = s.spawn(|| tx.send(queue.publish(2)).unwrap());

            assert_parked(&rx);
            assert!(queue.close(&stuck));
            assert_eq!(rx.recv_timeout(RELEASED), Ok(1));
            publisher.join().unwrap();
        });

        assert_eq!(live.read(), Some((2, 0)));
        assert_eq!(stuck.read(), None);
    }

    #[test]
    fn drop_poisons_readers() {
        let queue = BroadcastQueue::<u8>::new(1);
        let sub = queue.subscribe();
        drop(queue);
        assert!(sub.is_closed());
        assert_eq!(sub.read(), None);
    }

    #[test]
    fn churn_during_publish() {
        init_logger();
        const ITEMS: u64 = 2_000;
        let queue = BroadcastQueue::new(4);
        let anchor = queue.subscribe();

        thread::scope(|s| {
            s.spawn(|| {
                for item in 0..ITEMS {
                    assert!(queue.publish(item) >= 1);
                }
            });

            for _ in 0..4 {
                s.spawn(|| {
                    let mut rng = rand::thread_rng();
                    for _ in 0..20 {
                        let sub = queue.subscribe();
                        let mut last = None;
                        for _ in 0..rng.gen_range(1..10) {
                            match sub.try_read() {
                                Some((item, _)) => {
                                    // a subscriber sees a gapless run of the stream
                                    if let Some(last) = last {
                                        assert_eq!(item, last + 1);
                                    }
                                    last = Some(item);
                                }
                                None => thread::yield_now(),
                            }
                        }
                        assert!(queue.close(&sub));
                    }
                });
            }

            for expected in 0..ITEMS {
                assert_eq!(anchor.read(), Some((expected, (expected % 4) as usize)));
            }
        });

        assert_eq!(queue.subscriber_ids(), [anchor.id()]);
    }

    #[test]
    fn close_discards_buffered_count() {
        let queue = BroadcastQueue::new(4);
        let a = queue.subscribe();
        queue.publish(1);
        queue.publish(2);
        assert_eq!(a.buffered(), 2);

        assert!(queue.close(&a));
        assert_eq!(a.buffered(), 0);
        assert_eq!(a.try_read(), None);
    }

    #[test]
    fn concurrent_publishers_keep_their_own_order() {
        init_logger();
        const PUBLISHERS: u64 = 4;
        const PER_PUBLISHER: u64 = 250;
        let queue = BroadcastQueue::new(4);
        let subscribers: Vec<_> = (0..3).map(|_| queue.subscribe()).collect();
        let queue = &queue;

        let streams = thread::scope(|s| {
            for publisher in 0..PUBLISHERS {
                s.spawn(move || {
                    for n in 0..PER_PUBLISHER {
                        assert_eq!(queue.publish((publisher, n)), 3);
                    }
                });
            }

            let readers: Vec<_> = subscribers
                .iter()
                .map(|sub| {
                    s.spawn(move || {
                        (0..PUBLISHERS * PER_PUBLISHER)
                            .map(|_| sub.read().unwrap().0)
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            readers
                .into_iter()
                .map(|reader| reader.join().unwrap())
                .collect::<Vec<_>>()
        });

        // interleaving across publishers may differ per subscriber, but each
        // publisher's items arrive complete and in order everywhere
        for stream in &streams {
            for publisher in 0..PUBLISHERS {
                let own: Vec<u64> = stream
                    .iter()
                    .filter(|(from, _)| *from == publisher)
                    .map(|(_, n)| *n)
                    .collect();
                assert_eq!(own, (0..PER_PUBLISHER).collect::<Vec<_>>());
            }
        }
        for sub in &subscribers {
            assert_eq!(sub.buffered(), 0);
        }
    }
}
