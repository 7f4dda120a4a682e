#![allow(clippy::unwrap_used)]

// External crates
use lazy_static::lazy_static;
use prometheus::{
    Histogram, IntCounter, IntGauge, register_histogram, register_int_counter,
    register_int_gauge,
};
use std::time::Instant;

/// Helper to observe histogram duration
pub fn observe_duration(hist: &Histogram, start: Instant) {
    let elapsed = start.elapsed().as_secs_f64();
    hist.observe(elapsed);
}

lazy_static! {
    // ======== Broker Delivery Metrics ========

    /// Messages handed to the dispatcher by the MQTT session
    pub static ref MESSAGES_RECEIVED_TOTAL: IntCounter = register_int_counter!(
        "mqtt_logger_messages_received_total",
        "Total number of MQTT messages delivered by the broker"
    ).unwrap();

    /// Connection-lost notifications from the MQTT session
    pub static ref CONNECTION_LOST_TOTAL: IntCounter = register_int_counter!(
        "mqtt_logger_connection_lost_total",
        "Number of times the broker connection was lost"
    ).unwrap();

    // ======== Worker Pool Metrics ========

    /// Tasks accepted by the pool
    pub static ref TASKS_ENQUEUED_TOTAL: IntCounter = register_int_counter!(
        "mqtt_logger_tasks_enqueued_total",
        "Tasks accepted by the worker pool queue"
    ).unwrap();

    /// Tasks refused by the pool, stopped or full
    pub static ref TASKS_REJECTED_TOTAL: IntCounter = register_int_counter!(
        "mqtt_logger_tasks_rejected_total",
        "Tasks refused because the queue was full or the pool was stopping"
    ).unwrap();

    /// Tasks that ran to completion
    pub static ref TASKS_COMPLETED_TOTAL: IntCounter = register_int_counter!(
        "mqtt_logger_tasks_completed_total",
        "Tasks executed to completion by an executor"
    ).unwrap();

    /// Queued tasks dropped at shutdown
    pub static ref TASKS_DISCARDED_TOTAL: IntCounter = register_int_counter!(
        "mqtt_logger_tasks_discarded_total",
        "Queued tasks dropped unstarted at shutdown"
    ).unwrap();

    /// Tasks that panicked on an executor
    pub static ref TASKS_PANICKED_TOTAL: IntCounter = register_int_counter!(
        "mqtt_logger_tasks_panicked_total",
        "Tasks that panicked inside an executor"
    ).unwrap();

    /// Current number of queued, unstarted tasks
    pub static ref QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "mqtt_logger_queue_depth",
        "Number of tasks waiting in the worker pool queue"
    ).unwrap();

    /// Time an executor spent on one task
    pub static ref TASK_DURATION_SECONDS: Histogram = register_histogram!(
        "mqtt_logger_task_duration_seconds",
        "Histogram of per-message task execution durations in seconds",
        vec![0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05]
    ).unwrap();
}
