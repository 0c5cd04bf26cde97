use tracing::trace;

// Trace-based counters; the Prometheus recorder only renders what the
// exporter itself collects.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "vinrelay.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "vinrelay.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn transition(from: &str, to: &str) {
    trace!(
        target = "vinrelay.metrics",
        from = from,
        to = to,
        "status_transition_inc"
    );
}
