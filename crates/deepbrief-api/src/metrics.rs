use tracing::info;

pub fn run_started(run_id: &str, running: usize, available_permits: usize) {
    info!(
        target: "telemetry.api",
        run_id,
        running_runs = running,
        available_permits,
        event = "run_started"
    );
}

pub fn run_completed(run_id: &str, running: usize, available_permits: usize) {
    info!(
        target: "telemetry.api",
        run_id,
        running_runs = running,
        available_permits,
        event = "run_completed"
    );
}

pub fn run_failed(run_id: &str, running: usize, available_permits: usize, error: &str) {
    info!(
        target: "telemetry.api",
        run_id,
        running_runs = running,
        available_permits,
        error,
        event = "run_failed"
    );
}

pub fn stream_opened(run_id: &str) {
    info!(target: "telemetry.api", run_id, event = "stream_opened");
}
