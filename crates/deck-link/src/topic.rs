//! Latest-value telemetry topics.
//!
//! A [`Topic`] is an endless, lazily consumed sequence of updates. Producers
//! never block: a slow consumer only ever sees the most recent value and
//! misses whatever was overwritten in between.

use tokio::sync::watch;

use deck_proto::telemetry::{AttitudeEuler, BatteryUpdate, ConnectionEvent, GpsInfo, PositionUpdate};

pub struct TopicSender<T> {
    tx: watch::Sender<Option<T>>,
}

pub struct Topic<T> {
    rx: watch::Receiver<Option<T>>,
    primed: bool,
}

pub fn topic<T>() -> (TopicSender<T>, Topic<T>) {
    let (tx, rx) = watch::channel(None);
    (TopicSender { tx }, Topic { rx, primed: false })
}

impl<T> TopicSender<T> {
    pub fn publish(&self, value: T) {
        self.tx.send_replace(Some(value));
    }

    /// New consumer; it starts from the current value if one was published.
    pub fn subscribe(&self) -> Topic<T> {
        Topic { rx: self.tx.subscribe(), primed: true }
    }
}

impl<T: Clone> Topic<T> {
    /// Waits for the next value. `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<T> {
        if std::mem::take(&mut self.primed) {
            if let Some(v) = self.rx.borrow_and_update().clone() {
                return Some(v);
            }
        }
        loop {
            self.rx.changed().await.ok()?;
            if let Some(v) = self.rx.borrow_and_update().clone() {
                return Some(v);
            }
        }
    }
}

/// One sender per vehicle topic; link implementations publish through this.
pub struct TelemetryFeeds {
    pub connection: TopicSender<ConnectionEvent>,
    pub armed: TopicSender<bool>,
    pub in_air: TopicSender<bool>,
    pub position: TopicSender<PositionUpdate>,
    pub attitude: TopicSender<AttitudeEuler>,
    pub battery: TopicSender<BatteryUpdate>,
    pub gps: TopicSender<GpsInfo>,
}

impl TelemetryFeeds {
    pub fn new() -> Self {
        Self {
            connection: topic().0,
            armed: topic().0,
            in_air: topic().0,
            position: topic().0,
            attitude: topic().0,
            battery: topic().0,
            gps: topic().0,
        }
    }
}

impl Default for TelemetryFeeds {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscriber_sees_latest_only() {
        let (tx, _first) = topic::<u32>();
        tx.publish(1);
        tx.publish(2);
        let mut t = tx.subscribe();
        assert_eq!(t.next().await, Some(2));
        tx.publish(3);
        tx.publish(4);
        assert_eq!(t.next().await, Some(4));
    }

    #[tokio::test]
    async fn ends_when_sender_dropped() {
        let (tx, mut t) = topic::<bool>();
        tx.publish(true);
        assert_eq!(t.next().await, Some(true));
        drop(tx);
        assert_eq!(t.next().await, None);
    }
}
