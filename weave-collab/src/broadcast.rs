//! Fan-out of rendered frames to every socket in a project room.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each member gets an independent receiver that buffers up to `capacity`
//! deliveries; a member that falls further behind lags and loses the oldest.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// One event, rendered once, shared by every receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Text frames, one per emitted event name.
    pub frames: Vec<String>,
    /// Socket that must not receive this delivery.
    pub exclude: Option<String>,
}

impl Delivery {
    pub fn new(frames: Vec<String>, exclude: Option<String>) -> Self {
        Self { frames, exclude }
    }

    pub fn is_for(&self, socket_id: &str) -> bool {
        self.exclude.as_deref() != Some(socket_id)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub deliveries_sent: u64,
    pub deliveries_lagged: u64,
    pub active_members: usize,
}

/// Lock-free counters; read via `stats()`.
struct AtomicBroadcastStats {
    deliveries_sent: AtomicU64,
    deliveries_lagged: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            deliveries_sent: AtomicU64::new(0),
            deliveries_lagged: AtomicU64::new(0),
        }
    }
}

/// The broadcast group of one project room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Delivery>>,
    members: RwLock<HashSet<String>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many deliveries each member may have buffered.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashSet::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Register a socket and hand back its receiver.
    pub async fn add_member(&self, socket_id: &str) -> broadcast::Receiver<Arc<Delivery>> {
        let mut members = self.members.write().await;
        members.insert(socket_id.to_string());
        self.sender.subscribe()
    }

    pub async fn remove_member(&self, socket_id: &str) -> bool {
        self.members.write().await.remove(socket_id)
    }

    /// Send to every subscribed receiver, excluded or not; filtering by
    /// `Delivery::exclude` is the receiver's job. Returns the receiver count.
    pub fn broadcast(&self, delivery: Arc<Delivery>) -> usize {
        let count = self.sender.send(delivery).unwrap_or(0);
        self.atomic_stats
            .deliveries_sent
            .fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record that a receiver skipped `missed` deliveries.
    pub fn record_lag(&self, missed: u64) {
        self.atomic_stats
            .deliveries_lagged
            .fetch_add(missed, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, socket_id: &str) -> bool {
        self.members.read().await.contains(socket_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            deliveries_sent: self.atomic_stats.deliveries_sent.load(Ordering::Relaxed),
            deliveries_lagged: self.atomic_stats.deliveries_lagged.load(Ordering::Relaxed),
            active_members: self.members.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps project IDs to broadcast groups, so rooms never see each other's events.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Subscribe a socket to a room, opening the room's group if needed.
    ///
    /// Subscription happens under the rooms write lock, so a concurrent
    /// `remove_if_empty` can never release the group between lookup and join.
    pub async fn join(
        &self,
        room: &str,
        socket_id: &str,
    ) -> (Arc<BroadcastGroup>, broadcast::Receiver<Arc<Delivery>>) {
        let mut rooms = self.rooms.write().await;
        let group = match rooms.get(room) {
            Some(group) => group.clone(),
            None => {
                let group = Arc::new(BroadcastGroup::new(self.default_capacity));
                rooms.insert(room.to_string(), group.clone());
                log::debug!("Opened broadcast group for room {room}");
                group
            }
        };
        let rx = group.add_member(socket_id).await;
        (group, rx)
    }

    pub async fn get(&self, room: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room).cloned()
    }

    /// Release a room's group once it has no local members.
    pub async fn remove_if_empty(&self, room: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(group) = rooms.get(room) {
            if group.member_count().await == 0 {
                rooms.remove(room);
                log::debug!("Released broadcast group for room {room}");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(frame: &str, exclude: Option<&str>) -> Arc<Delivery> {
        Arc::new(Delivery::new(vec![frame.to_string()], exclude.map(String::from)))
    }

    #[tokio::test]
    async fn test_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let _rx = group.add_member("s1").await;
        assert_eq!(group.member_count().await, 1);
        assert!(group.has_member("s1").await);

        assert!(group.remove_member("s1").await);
        assert!(!group.remove_member("s1").await);
        assert_eq!(group.member_count().await, 0);
    }

    #[tokio::test]
    async fn test_fan_out_and_exclusion() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.add_member("s1").await;
        let mut rx2 = group.add_member("s2").await;

        // Every receiver gets the delivery; exclusion is checked on receipt.
        assert_eq!(group.broadcast(delivery("f", Some("s1"))), 2);

        let d1 = rx1.recv().await.unwrap();
        let d2 = rx2.recv().await.unwrap();
        assert!(!d1.is_for("s1"));
        assert!(d2.is_for("s2"));
        assert!(Arc::ptr_eq(&d1, &d2));
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_member("s1").await;
        for i in 0..5 {
            group.broadcast(delivery(&i.to_string(), None));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => {
                group.record_lag(n);
                assert_eq!(n, 3);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        let stats = group.stats().await;
        assert_eq!(stats.deliveries_sent, 5);
        assert_eq!(stats.deliveries_lagged, 3);
        assert_eq!(stats.active_members, 1);
    }

    #[tokio::test]
    async fn test_room_manager_join() {
        let manager = RoomManager::new(16);
        let (a, _rx1) = manager.join("p1", "s1").await;
        let (b, _rx2) = manager.join("p1", "s2").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.member_count().await, 2);
        let _c = manager.join("p2", "s1").await;
        assert_eq!(manager.room_count().await, 2);

        let mut rooms = manager.active_rooms().await;
        rooms.sort();
        assert_eq!(rooms, vec!["p1", "p2"]);
        assert!(manager.get("p3").await.is_none());
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager = RoomManager::new(16);
        let (group, _rx) = manager.join("p", "s1").await;

        assert!(!manager.remove_if_empty("p").await);
        group.remove_member("s1").await;
        assert!(manager.remove_if_empty("p").await);
        assert_eq!(manager.room_count().await, 0);
        assert!(!manager.remove_if_empty("p").await);
    }

    #[tokio::test]
    async fn test_join_after_release_opens_live_group() {
        let manager = RoomManager::new(16);
        let (group, _) = manager.join("p", "s1").await;
        group.remove_member("s1").await;
        assert!(manager.remove_if_empty("p").await);

        let (joined, mut rx) = manager.join("p", "s2").await;
        let live = manager.get("p").await.expect("room registered");
        assert!(Arc::ptr_eq(&joined, &live));
        live.broadcast(delivery("after", None));
        assert_eq!(rx.recv().await.unwrap().frames, vec!["after"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_join_races_release() {
        let manager = Arc::new(RoomManager::new(16));
        for i in 0..200 {
            let (group, _) = manager.join("p", "leaver").await;
            group.remove_member("leaver").await;

            let releaser = {
                let manager = manager.clone();
                tokio::spawn(async move { manager.remove_if_empty("p").await })
            };
            let joiner = {
                let manager = manager.clone();
                tokio::spawn(async move { manager.join("p", "z").await })
            };
            let _ = releaser.await.unwrap();
            let (joined, mut rx) = joiner.await.unwrap();

            // Whatever the interleaving, the joiner's group is the registered one.
            let live = manager.get("p").await.expect("room registered");
            assert!(Arc::ptr_eq(&joined, &live), "iteration {i}");
            assert!(live.has_member("z").await);
            live.broadcast(delivery("x", None));
            assert!(rx.recv().await.is_ok());

            live.remove_member("z").await;
            assert!(manager.remove_if_empty("p").await);
        }
    }

    #[test]
    fn test_capacity() {
        assert_eq!(BroadcastGroup::new(32).capacity(), 32);
    }
}
