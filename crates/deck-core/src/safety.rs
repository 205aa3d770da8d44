use std::time::Duration;

use tokio::time::Instant;

/// Minimum spacing between input-driven setpoint sends.
#[derive(Debug)]
pub struct SendRateLimit {
    last: Option<Instant>,
    min_interval: Duration,
}

impl SendRateLimit {
    pub fn new(min_interval: Duration) -> Self {
        Self { last: None, min_interval }
    }

    /// True (and stamps) when the window since the last send has passed.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        if let Some(t) = self.last {
            if now.duration_since(t) < self.min_interval { return false; }
        }
        self.last = Some(now);
        true
    }

    /// Records a send that bypassed [`allow`](Self::allow).
    pub fn stamp(&mut self) {
        self.last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn spaces_sends() {
        let mut l = SendRateLimit::new(Duration::from_millis(50));
        assert!(l.allow());
        assert!(!l.allow());
        tokio::time::advance(Duration::from_millis(49)).await;
        assert!(!l.allow());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(l.allow());
        l.stamp();
        assert!(!l.allow());
    }
}
