#[cfg(feature = "metrics")]
mod imp {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use tracing::info;

    // Connections (cumulative)
    static ACCEPTED: AtomicU64 = AtomicU64::new(0);
    static REJECTED_BUSY: AtomicU64 = AtomicU64::new(0);
    static EVICTED: AtomicU64 = AtomicU64::new(0);
    // Throughput (cumulative)
    static REQUESTS: AtomicU64 = AtomicU64::new(0);
    static RESPONSES: AtomicU64 = AtomicU64::new(0);
    // Backpressure / failures
    static QUEUE_FULL: AtomicU64 = AtomicU64::new(0);
    static WRITE_FAILURES: AtomicU64 = AtomicU64::new(0);

    #[derive(Clone, Copy, Debug, Default)]
    pub struct MetricsSnapshot {
        pub accepted: u64,
        pub rejected_busy: u64,
        pub evicted: u64,
        pub requests: u64,
        pub responses: u64,
        pub queue_full: u64,
        pub write_failures: u64,
    }

    pub fn inc_accepted() {
        ACCEPTED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected_busy() {
        REJECTED_BUSY.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_evicted() {
        EVICTED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests() {
        REQUESTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_responses() {
        RESPONSES.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_queue_full() {
        QUEUE_FULL.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_write_failures() {
        WRITE_FAILURES.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            accepted: ACCEPTED.load(Ordering::Relaxed),
            rejected_busy: REJECTED_BUSY.load(Ordering::Relaxed),
            evicted: EVICTED.load(Ordering::Relaxed),
            requests: REQUESTS.load(Ordering::Relaxed),
            responses: RESPONSES.load(Ordering::Relaxed),
            queue_full: QUEUE_FULL.load(Ordering::Relaxed),
            write_failures: WRITE_FAILURES.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_reporter() {
        const INTERVAL_SECS: u64 = 10;
        let spawned = std::thread::Builder::new()
            .name("metrics".into())
            .spawn(|| {
                let mut last = snapshot();
                loop {
                    std::thread::sleep(Duration::from_secs(INTERVAL_SECS));
                    let snap = snapshot();
                    info!(
                        interval_secs = INTERVAL_SECS,
                        accepted = snap.accepted.saturating_sub(last.accepted),
                        rejected_busy = snap.rejected_busy.saturating_sub(last.rejected_busy),
                        evicted = snap.evicted.saturating_sub(last.evicted),
                        requests = snap.requests.saturating_sub(last.requests),
                        responses = snap.responses.saturating_sub(last.responses),
                        queue_full = snap.queue_full.saturating_sub(last.queue_full),
                        write_failures = snap.write_failures.saturating_sub(last.write_failures),
                        "metrics delta"
                    );
                    last = snap;
                }
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "failed to start metrics reporter");
        }
    }
}

#[cfg(not(feature = "metrics"))]
#[allow(dead_code)]
mod imp {
    #[derive(Clone, Copy, Debug, Default)]
    pub struct MetricsSnapshot {
        pub accepted: u64,
        pub rejected_busy: u64,
        pub evicted: u64,
        pub requests: u64,
        pub responses: u64,
        pub queue_full: u64,
        pub write_failures: u64,
    }

    pub fn inc_accepted() {}
    pub fn inc_rejected_busy() {}
    pub fn inc_evicted() {}
    pub fn inc_requests() {}
    pub fn inc_responses() {}
    pub fn inc_queue_full() {}
    pub fn inc_write_failures() {}
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot::default()
    }
    pub fn spawn_reporter() {}
}

pub use imp::*;
