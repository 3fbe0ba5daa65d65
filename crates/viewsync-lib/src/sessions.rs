// ============================
// viewsync-lib/src/sessions.rs
// ============================
//! Connection registry, subscription groups, and per-address rate limiting.
//!
//! Each WebSocket connection registers an outbound channel here. Rooms only
//! ever hold connection ids; the registry maps ids back to live channels,
//! so dropping a connection cannot leak a room and vice versa.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::warn;
use viewsync_common::events::ServerEvent;

pub type ConnectionId = String;

/// Outbound channel depth per connection. A viewer that cannot drain this
/// many events is considered slow; overflow events are dropped and the
/// client recovers via `request-initial-state`.
pub const OUTBOUND_BUFFER: usize = 64;

/// Events allowed per window.
pub const RATE_LIMIT_MAX_EVENTS: u32 = 100;
/// Window length.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(10);
/// Cooldown applied once the window is exhausted.
pub const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct ConnectionEntry {
    sender: mpsc::Sender<ServerEvent>,
    #[allow(dead_code)]
    remote_addr: IpAddr,
    #[allow(dead_code)]
    joined_at: DateTime<Utc>,
}

/// Registry of live connections and their room subscription groups.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    groups: DashMap<String, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        conn_id: &str,
        remote_addr: IpAddr,
        sender: mpsc::Sender<ServerEvent>,
    ) {
        self.connections.insert(
            conn_id.to_string(),
            ConnectionEntry {
                sender,
                remote_addr,
                joined_at: Utc::now(),
            },
        );
    }

    /// Drop a connection and remove it from every group.
    pub fn unregister(&self, conn_id: &str) {
        self.connections.remove(conn_id);
        for mut group in self.groups.iter_mut() {
            group.value_mut().remove(conn_id);
        }
        self.groups.retain(|_, members| !members.is_empty());
    }

    pub fn join_group(&self, room_code: &str, conn_id: &str) {
        self.groups
            .entry(room_code.to_uppercase())
            .or_default()
            .insert(conn_id.to_string());
    }

    pub fn leave_group(&self, room_code: &str, conn_id: &str) {
        let key = room_code.to_uppercase();
        if let Some(mut members) = self.groups.get_mut(&key) {
            members.remove(conn_id);
        }
        self.groups.remove_if(&key, |_, members| members.is_empty());
    }

    pub fn group_size(&self, room_code: &str) -> usize {
        self.groups
            .get(&room_code.to_uppercase())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Send one event to one connection. Full buffers drop the event; the
    /// authoritative state is recoverable via a snapshot request.
    pub fn send_to(&self, conn_id: &str, event: ServerEvent) {
        if let Some(entry) = self.connections.get(conn_id) {
            if entry.sender.try_send(event).is_err() {
                warn!(conn = %conn_id, "outbound buffer full, dropping event");
            }
        }
    }

    /// Deliver an event to every current member of a room group exactly
    /// once.
    pub fn broadcast_room(&self, room_code: &str, event: &ServerEvent) {
        let members: Vec<ConnectionId> = match self.groups.get(&room_code.to_uppercase()) {
            Some(members) => members.iter().cloned().collect(),
            None => return,
        };
        metrics::counter!("event.broadcast").increment(1);
        for conn_id in members {
            self.send_to(&conn_id, event.clone());
        }
    }

    /// Deliver an event to every connection on the server (process-wide
    /// notifications such as `rooms-updated`).
    pub fn broadcast_all(&self, event: &ServerEvent) {
        for entry in self.connections.iter() {
            if entry.value().sender.try_send(event.clone()).is_err() {
                warn!(conn = %entry.key(), "outbound buffer full, dropping event");
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[derive(Debug)]
struct Bucket {
    count: u32,
    window_start: Instant,
    cooldown_until: Option<Instant>,
}

/// Token-bucket limiter keyed by remote address. The default shape is the
/// event-channel budget (100 events per 10 s, 5 s cooldown once exhausted);
/// HTTP endpoints build their own shapes with [`EventRateLimiter::with_limits`].
/// Loopback traffic always bypasses the limiter.
#[derive(Debug)]
pub struct EventRateLimiter {
    buckets: DashMap<IpAddr, Bucket>,
    max_events: u32,
    window: Duration,
    cooldown: Duration,
}

impl Default for EventRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRateLimiter {
    pub fn new() -> Self {
        Self::with_limits(RATE_LIMIT_MAX_EVENTS, RATE_LIMIT_WINDOW, RATE_LIMIT_COOLDOWN)
    }

    pub fn with_limits(max_events: u32, window: Duration, cooldown: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            max_events,
            window,
            cooldown,
        }
    }

    /// Account one inbound event. `Err(retry_after_secs)` means the event
    /// must be dropped and the sender told to back off.
    pub fn check(&self, addr: IpAddr) -> Result<(), u64> {
        if addr.is_loopback() {
            return Ok(());
        }
        let now = Instant::now();
        let mut bucket = self.buckets.entry(addr).or_insert_with(|| Bucket {
            count: 0,
            window_start: now,
            cooldown_until: None,
        });

        if let Some(until) = bucket.cooldown_until {
            if now < until {
                return Err((until - now).as_secs().max(1));
            }
            bucket.cooldown_until = None;
            bucket.count = 0;
            bucket.window_start = now;
        }

        if now.duration_since(bucket.window_start) > self.window {
            bucket.count = 0;
            bucket.window_start = now;
        }

        bucket.count += 1;
        if bucket.count > self.max_events {
            bucket.cooldown_until = Some(now + self.cooldown);
            return Err(self.cooldown.as_secs().max(1));
        }

        Ok(())
    }

    /// Drop buckets that have gone quiet.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.buckets.retain(|_, bucket| {
            bucket
                .cooldown_until
                .map(|until| now < until)
                .unwrap_or(true)
                && now.duration_since(bucket.window_start) < self.window * 6
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use viewsync_common::events::ServerEvent;

    fn remote() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))
    }

    #[tokio::test]
    async fn broadcast_reaches_each_member_once() {
        let registry = ConnectionRegistry::new();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        registry.register("c1", remote(), tx1);
        registry.register("c2", remote(), tx2);
        registry.join_group("ABC234", "c1");
        registry.join_group("abc234", "c1"); // joining twice is idempotent
        registry.join_group("ABC234", "c2");

        registry.broadcast_room("ABC234", &ServerEvent::ViewerCount(2));

        assert_eq!(rx1.try_recv().unwrap(), ServerEvent::ViewerCount(2));
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap(), ServerEvent::ViewerCount(2));
    }

    #[tokio::test]
    async fn leave_group_stops_delivery() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        registry.register("c1", remote(), tx);
        registry.join_group("ROOM42", "c1");
        registry.leave_group("ROOM42", "c1");

        registry.broadcast_room("ROOM42", &ServerEvent::ViewerCount(0));
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.group_size("ROOM42"), 0);
    }

    #[tokio::test]
    async fn unregister_removes_from_all_groups() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        registry.register("c1", remote(), tx);
        registry.join_group("AAAAAA", "c1");
        registry.join_group("BBBBBB", "c1");
        registry.unregister("c1");
        assert_eq!(registry.group_size("AAAAAA"), 0);
        assert_eq!(registry.group_size("BBBBBB"), 0);
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn events_to_one_connection_stay_ordered() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        registry.register("c1", remote(), tx);
        registry.join_group("ROOM42", "c1");

        for count in 1..=3 {
            registry.broadcast_room("ROOM42", &ServerEvent::ViewerCount(count));
        }
        for expected in 1..=3 {
            assert_eq!(rx.recv().await.unwrap(), ServerEvent::ViewerCount(expected));
        }
    }

    #[test]
    fn rate_limiter_exhausts_then_cools_down() {
        let limiter = EventRateLimiter::new();
        let addr = remote();
        for _ in 0..RATE_LIMIT_MAX_EVENTS {
            assert!(limiter.check(addr).is_ok());
        }
        let retry = limiter.check(addr).unwrap_err();
        assert!(retry >= 1 && retry <= RATE_LIMIT_COOLDOWN.as_secs());
        // still cooling down
        assert!(limiter.check(addr).is_err());
    }

    #[test]
    fn loopback_bypasses_rate_limit() {
        let limiter = EventRateLimiter::new();
        let addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
        for _ in 0..(RATE_LIMIT_MAX_EVENTS * 3) {
            assert!(limiter.check(addr).is_ok());
        }
    }
}
