use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder};
use std::sync::OnceLock;

static SUBMITTED: OnceLock<IntCounter> = OnceLock::new();
static ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static REJECTED: OnceLock<IntCounter> = OnceLock::new();
static JOB_BROADCASTS: OnceLock<IntCounter> = OnceLock::new();
static UPSTREAM_RECONNECTS: OnceLock<IntCounter> = OnceLock::new();
static PENDING_EVICTIONS: OnceLock<IntCounter> = OnceLock::new();
static FRAMES_DROPPED: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_SESSIONS: OnceLock<IntGauge> = OnceLock::new();
static UPSTREAM_UP: OnceLock<IntGauge> = OnceLock::new();
static PENDING_REQUESTS: OnceLock<IntGauge> = OnceLock::new();

fn submitted() -> &'static IntCounter {
    SUBMITTED.get_or_init(|| {
        IntCounter::new("shares_submitted_total", "Total shares forwarded upstream").unwrap()
    })
}

fn accepted() -> &'static IntCounter {
    ACCEPTED.get_or_init(|| {
        IntCounter::new("shares_accepted_total", "Total accepted shares").unwrap()
    })
}

fn rejected() -> &'static IntCounter {
    REJECTED.get_or_init(|| {
        IntCounter::new("shares_rejected_total", "Total rejected shares").unwrap()
    })
}

fn job_broadcasts() -> &'static IntCounter {
    JOB_BROADCASTS.get_or_init(|| {
        IntCounter::new(
            "job_broadcasts_total",
            "Total job/difficulty broadcasts to downstream sessions",
        )
        .unwrap()
    })
}

fn upstream_reconnects() -> &'static IntCounter {
    UPSTREAM_RECONNECTS.get_or_init(|| {
        IntCounter::new(
            "upstream_reconnects_total",
            "Total upstream reconnect cycles",
        )
        .unwrap()
    })
}

fn pending_evictions() -> &'static IntCounter {
    PENDING_EVICTIONS.get_or_init(|| {
        IntCounter::new(
            "pending_evictions_total",
            "Pending submits evicted by the capacity bound",
        )
        .unwrap()
    })
}

fn frames_dropped() -> &'static IntCounter {
    FRAMES_DROPPED.get_or_init(|| {
        IntCounter::new(
            "frames_dropped_total",
            "Unparsable upstream frames dropped",
        )
        .unwrap()
    })
}

fn active_sessions() -> &'static IntGauge {
    ACTIVE_SESSIONS.get_or_init(|| {
        IntGauge::new("ws_active_sessions", "Connected WebSocket miner sessions").unwrap()
    })
}

fn upstream_up() -> &'static IntGauge {
    UPSTREAM_UP.get_or_init(|| {
        IntGauge::new("upstream_up", "Upstream pool connection established (1/0)").unwrap()
    })
}

fn pending_requests() -> &'static IntGauge {
    PENDING_REQUESTS.get_or_init(|| {
        IntGauge::new("pending_requests", "Outstanding upstream submit requests").unwrap()
    })
}

pub fn inc_submitted() {
    submitted().inc();
}

pub fn inc_accepted() {
    accepted().inc();
}

pub fn inc_rejected() {
    rejected().inc();
}

pub fn inc_job_broadcasts() {
    job_broadcasts().inc();
}

pub fn inc_upstream_reconnects() {
    upstream_reconnects().inc();
}

pub fn inc_pending_evictions() {
    pending_evictions().inc();
}

pub fn inc_frames_dropped() {
    frames_dropped().inc();
}

pub fn inc_sessions() {
    active_sessions().inc();
}

pub fn dec_sessions() {
    active_sessions().dec();
}

pub fn set_upstream_up(up: bool) {
    upstream_up().set(if up { 1 } else { 0 });
}

pub fn set_pending_requests(len: usize) {
    pending_requests().set(len as i64);
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(submitted().collect());
    mfs.extend(accepted().collect());
    mfs.extend(rejected().collect());
    mfs.extend(job_broadcasts().collect());
    mfs.extend(upstream_reconnects().collect());
    mfs.extend(pending_evictions().collect());
    mfs.extend(frames_dropped().collect());
    mfs.extend(active_sessions().collect());
    mfs.extend(upstream_up().collect());
    mfs.extend(pending_requests().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}
