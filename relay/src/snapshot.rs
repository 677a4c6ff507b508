//! JSON documents served by the control socket and the status page.

use crate::config::Mode;
use crate::context::RelayContext;
use crate::metrics::get;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::time::SystemTime;

fn rfc3339(time: Option<SystemTime>) -> String {
    match time {
        Some(time) => DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Secs, true),
        None => String::new(),
    }
}

pub fn settings_json(context: &RelayContext) -> Value {
    json!({
        "delay": context.settings.delay_ms(),
        "backoff": context.settings.backoff().as_millis() as u64,
        "live_stats_port": context.settings.live_stats_port(),
        "verbosity": context.settings.verbosity(),
        "mode": match context.mode {
            Mode::Merging => "merging",
            Mode::Switching => "switching",
        },
    })
}

pub fn stats_json(context: &RelayContext) -> Value {
    let delay_ms = context.settings.delay_ms();
    let inputs: Vec<Value> = context
        .sources
        .iter()
        .map(|source| {
            let margin = source.margin_stats();
            let (mean_del, min_del, max_del) = match delay_ms {
                Some(d) => (
                    json!(margin.mean + d as f64),
                    json!(margin.min + d as f64),
                    json!(margin.max + d as f64),
                ),
                None => (Value::Null, Value::Null, Value::Null),
            };
            let error = source.last_connect_error();
            json!({
                "hostname": source.hostname,
                "port": source.port,
                "last_packet_received_at": rfc3339(source.last_rx_wall()),
                "connection_uptime": source.connection_uptime_ms(),
                "connected": source.connected.load(std::sync::atomic::Ordering::Relaxed),
                "active": source.is_active(),
                "enabled": source.is_enabled(),
                "stats": {
                    "margin": {
                        "mean": margin.mean,
                        "min": margin.min,
                        "max": margin.max,
                        "mean_to_delivery": mean_del,
                        "min_to_delivery": min_del,
                        "max_to_delivery": max_del,
                        "stdev": margin.stdev,
                        "num_measurements": margin.num_measurements,
                    },
                    "num_late_frames": source.num_late.load(std::sync::atomic::Ordering::Relaxed),
                    "num_connects": source.num_connects.load(std::sync::atomic::Ordering::Relaxed),
                    "most_recent_connect_error": error.as_ref().map(|e| e.message.clone()).unwrap_or_default(),
                    "most_recent_connect_error_timestamp": rfc3339(error.map(|e| e.at)),
                },
            })
        })
        .collect();

    let backoff_remain = context.gate.remaining_ms();
    let tcp_stats: Vec<Value> = context
        .tcp_outputs
        .iter()
        .map(|server| {
            let stats = server.stats();
            json!({ "listen_port": stats.listen_port, "num_connections": stats.num_connections })
        })
        .collect();

    json!({
        "inputs": inputs,
        "main": {
            "poll_timeouts": get(&context.counters.num_poll_timeouts),
            "process_uptime": context.startup.elapsed().as_millis() as u64,
        },
        "output": {
            "num_frames": get(&context.counters.num_frames),
            "late_score": context.queue.late_score(),
            "num_dlfc_discontinuities": get(&context.counters.num_dlfc_discontinuities),
            "num_queue_overruns": get(&context.counters.num_queue_overruns),
            "num_dropped_frames": get(&context.counters.num_dropped),
            "backoff_remain_ms": backoff_remain,
            "in_backoff": backoff_remain > 0,
            "tcp_stats": tcp_stats,
        },
    })
}
