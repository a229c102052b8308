pub(crate) const METRIC_TASKS_STARTED: &str = "lifecycle_tasks_started_total";
pub(crate) const METRIC_TASK_RESULTS: &str = "lifecycle_task_results_total";
pub(crate) const METRIC_SHUTDOWN_INITIATED: &str = "lifecycle_shutdown_initiated_total";
pub(crate) const METRIC_SHUTDOWN_FN_RESULTS: &str = "lifecycle_shutdown_fn_results_total";
pub(crate) const METRIC_SHUTDOWN_DURATION: &str = "lifecycle_shutdown_duration_seconds";
pub(crate) const METRIC_FORCED_EXITS: &str = "lifecycle_forced_exits_total";

pub(crate) fn emit_task_started(group: &str) {
    metrics::counter!(METRIC_TASKS_STARTED, "group" => group.to_string()).increment(1);
}

pub(crate) fn emit_task_result(group: &str, result: &str) {
    metrics::counter!(
        METRIC_TASK_RESULTS,
        "group" => group.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_shutdown_initiated(group: &str, trigger: &str) {
    metrics::counter!(
        METRIC_SHUTDOWN_INITIATED,
        "group" => group.to_string(),
        "trigger" => trigger.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_shutdown_fn_result(group: &str, result: &str) {
    metrics::counter!(
        METRIC_SHUTDOWN_FN_RESULTS,
        "group" => group.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_shutdown_duration(group: &str, clean: bool, duration_secs: f64) {
    metrics::histogram!(
        METRIC_SHUTDOWN_DURATION,
        "group" => group.to_string(),
        "clean" => clean.to_string()
    )
    .record(duration_secs);
}

pub(crate) fn emit_forced_exit(group: &str) {
    metrics::counter!(METRIC_FORCED_EXITS, "group" => group.to_string()).increment(1);
}
