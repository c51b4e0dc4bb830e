use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static CONNECT_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "switchyard_connect_attempts_total",
            "switch connect attempts by session",
        ),
        &["session"],
    )
    .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SESSION_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "switchyard_session_failures_total",
            "connect attempts that ended in teardown, by session and cause",
        ),
        &["session", "cause"],
    )
    .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static QUEUE_DELIVERED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "switchyard_queue_delivered_total",
            "inbound messages handed to consumer queues by kind",
        ),
        &["kind"],
    )
    .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static QUEUE_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "switchyard_queue_dropped_total",
            "inbound messages dropped by consumer queue backpressure or missing consumers, by kind",
        ),
        &["kind", "reason"],
    )
    .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static ROLE_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "switchyard_role_transitions_total",
            "primary/backup transitions by session and new role",
        ),
        &["session", "role"],
    )
    .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static JOB_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "switchyard_job_failures_total",
            "supervised jobs that failed unexpectedly, by severity",
        ),
        &["severity"],
    )
    .expect("valid metric");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Render every registered metric in the text exposition format.
pub fn gather() -> String {
    Lazy::force(&CONNECT_ATTEMPTS);
    Lazy::force(&SESSION_FAILURES);
    Lazy::force(&QUEUE_DELIVERED);
    Lazy::force(&QUEUE_DROPPED);
    Lazy::force(&ROLE_TRANSITIONS);
    Lazy::force(&JOB_FAILURES);

    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_includes_queue_drops() {
        QUEUE_DROPPED.with_label_values(&["digest", "full"]).inc();
        let text = gather();
        assert!(text.contains("switchyard_queue_dropped_total"));
        assert!(text.contains("reason=\"full\""));
    }
}
