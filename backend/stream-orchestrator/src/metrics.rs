use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, TextEncoder};

static ACTIVE_ROOMS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "stream_orchestrator_active_rooms",
        "Rooms currently registered (all lifecycle states except deleted)",
    )
    .expect("failed to create stream_orchestrator_active_rooms");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register stream_orchestrator_active_rooms");
    gauge
});

static PARTICIPANTS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new(
            "stream_orchestrator_participants",
            "Connected participants by role",
        ),
        &["role"],
    )
    .expect("failed to create stream_orchestrator_participants");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register stream_orchestrator_participants");
    gauge
});

static READY_WORKERS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "stream_orchestrator_ready_workers",
        "Media workers currently accepting rooms",
    )
    .expect("failed to create stream_orchestrator_ready_workers");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register stream_orchestrator_ready_workers");
    gauge
});

static WORKER_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "stream_orchestrator_worker_failures_total",
        "Media worker crashes observed",
    )
    .expect("failed to create stream_orchestrator_worker_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register stream_orchestrator_worker_failures_total");
    counter
});

static SIGNALING_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "stream_orchestrator_signaling_events_total",
            "Inbound signaling events by type and outcome",
        ),
        &["event", "outcome"],
    )
    .expect("failed to create stream_orchestrator_signaling_events_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register stream_orchestrator_signaling_events_total");
    counter
});

static RATE_LIMITED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "stream_orchestrator_rate_limited_total",
            "Attempts rejected by the connection gate",
        ),
        &["scope"],
    )
    .expect("failed to create stream_orchestrator_rate_limited_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register stream_orchestrator_rate_limited_total");
    counter
});

static TIPS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "stream_orchestrator_tips_total",
        "Tips accepted at the signaling boundary",
    )
    .expect("failed to create stream_orchestrator_tips_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register stream_orchestrator_tips_total");
    counter
});

static VIEWER_FLUSHES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "stream_orchestrator_viewer_flushes_total",
        "Viewer-count net deltas applied to the store",
    )
    .expect("failed to create stream_orchestrator_viewer_flushes_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register stream_orchestrator_viewer_flushes_total");
    counter
});

pub fn room_opened() {
    ACTIVE_ROOMS.inc();
}

pub fn room_closed() {
    ACTIVE_ROOMS.dec();
}

pub fn participant_joined(role: &str) {
    PARTICIPANTS.with_label_values(&[role]).inc();
}

pub fn participant_left(role: &str) {
    PARTICIPANTS.with_label_values(&[role]).dec();
}

pub fn set_worker_count(count: usize) {
    READY_WORKERS.set(count as i64);
}

pub fn worker_failure() {
    WORKER_FAILURES_TOTAL.inc();
}

pub fn observe_event(event: &str, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    SIGNALING_EVENTS_TOTAL
        .with_label_values(&[event, outcome])
        .inc();
}

pub fn rate_limited(scope: &str) {
    RATE_LIMITED_TOTAL.with_label_values(&[scope]).inc();
}

pub fn tip_accepted() {
    TIPS_TOTAL.inc();
}

pub fn viewer_flush_applied() {
    VIEWER_FLUSHES_TOTAL.inc();
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
