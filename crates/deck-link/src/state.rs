use std::time::Duration;
use tokio::time::Instant;

/// Vehicle heartbeat bookkeeping for the MAVLink link.
#[derive(Debug, Clone, Default)]
pub struct LinkStatus {
    pub connected: bool,
    pub last_heartbeat: Option<Instant>,
    pub custom_mode: Option<u32>,
    pub heartbeats: u64,
}

impl LinkStatus {
    pub fn hb_age(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }

    /// Records a vehicle heartbeat; true when this brings the link up.
    pub fn on_heartbeat(&mut self, custom_mode: u32) -> bool {
        self.last_heartbeat = Some(Instant::now());
        self.custom_mode = Some(custom_mode);
        self.heartbeats += 1;
        !std::mem::replace(&mut self.connected, true)
    }

    /// Drops the link after `timeout` of silence. Returns the new value on change.
    pub fn evaluate(&mut self, timeout: Duration) -> Option<bool> {
        let alive = self.hb_age().map(|age| age <= timeout).unwrap_or(false);
        if alive == self.connected {
            return None;
        }
        self.connected = alive;
        Some(alive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn heartbeat_silence_drops_link() {
        let mut st = LinkStatus::default();
        assert_eq!(st.evaluate(Duration::from_secs(3)), None);
        assert!(st.on_heartbeat(0));
        assert!(!st.on_heartbeat(0));
        assert_eq!(st.evaluate(Duration::from_secs(3)), None);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(st.evaluate(Duration::from_secs(3)), Some(false));
        assert!(st.on_heartbeat(0));
        assert_eq!(st.heartbeats, 3);
    }
}
