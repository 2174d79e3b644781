use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    sessions_active: AtomicU64,
    session_takeovers: AtomicU64,
    frames_ingress: AtomicU64,
    frames_egress: AtomicU64,
    messages_persisted: AtomicU64,
    messages_published: AtomicU64,
    messages_dropped: AtomicU64,
    uploads_failed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_sessions(&self) {
        self.sessions_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_sessions(&self) {
        self.sessions_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn mark_takeover(&self) {
        self.session_takeovers.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_ingress(&self) {
        self.frames_ingress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_egress(&self) {
        self.frames_egress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_persisted(&self) {
        self.messages_persisted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_published(&self) {
        self.messages_published.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_upload_failed(&self) {
        self.uploads_failed.fetch_add(1, Ordering::SeqCst);
        self.messages_dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn encode_prometheus(&self) -> String {
        format!(
            "# TYPE courier_sessions_active gauge\ncourier_sessions_active {}\n# TYPE courier_session_takeovers counter\ncourier_session_takeovers {}\n# TYPE courier_frames_ingress counter\ncourier_frames_ingress {}\n# TYPE courier_frames_egress counter\ncourier_frames_egress {}\n# TYPE courier_messages_persisted counter\ncourier_messages_persisted {}\n# TYPE courier_messages_published counter\ncourier_messages_published {}\n# TYPE courier_messages_dropped counter\ncourier_messages_dropped {}\n# TYPE courier_uploads_failed counter\ncourier_uploads_failed {}\n",
            self.sessions_active.load(Ordering::SeqCst),
            self.session_takeovers.load(Ordering::SeqCst),
            self.frames_ingress.load(Ordering::SeqCst),
            self.frames_egress.load(Ordering::SeqCst),
            self.messages_persisted.load(Ordering::SeqCst),
            self.messages_published.load(Ordering::SeqCst),
            self.messages_dropped.load(Ordering::SeqCst),
            self.uploads_failed.load(Ordering::SeqCst)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.incr_sessions();
        metrics.mark_persisted();
        metrics.mark_upload_failed();
        let encoded = metrics.encode_prometheus();
        assert!(encoded.contains("courier_sessions_active 1"));
        assert!(encoded.contains("courier_messages_persisted 1"));
        assert!(encoded.contains("courier_uploads_failed 1"));
        assert!(encoded.contains("courier_messages_dropped 1"));
        metrics.decr_sessions();
        assert!(metrics.encode_prometheus().contains("courier_sessions_active 0"));
    }
}
