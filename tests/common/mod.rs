// Shared helpers for integration tests
//
// Jobs are written as JSON, the same way users describe them, and loaded at
// 10 ns per timeslice so timeslice `i` covers nanoseconds `[10 i, 10 i + 9]`.

#![allow(dead_code)]

use phaselens::job::{JobDescription, LoadedJob};
use phaselens::time::Time;
use serde_json::{json, Value};
use std::path::PathBuf;

pub const NS_PER_TIMESLICE: i64 = 10;

pub fn time() -> Time {
    Time::new(NS_PER_TIMESLICE).unwrap()
}

/// Nanosecond range covering timeslices `[first, last]`
pub fn ns(first: i64, last: i64) -> (i64, i64) {
    (first * NS_PER_TIMESLICE, (last + 1) * NS_PER_TIMESLICE)
}

pub fn load(value: Value) -> LoadedJob {
    JobDescription::from_json(&value.to_string())
        .unwrap()
        .load(time())
        .unwrap()
}

/// Flat job of repeatable, interchangeable leaf `task` phases on one node
///
/// `tasks` are `(id, first, last)` timeslice ranges; `cpu` lists
/// `(first, last, value)` observation periods of a capacity 10 cpu; `gc` lists
/// blocked timeslice ranges.
pub fn flat_job(tasks: &[(&str, i64, i64)], cpu: &[(i64, i64, f64)], gc: &[(i64, i64)]) -> Value {
    let first = tasks.iter().map(|t| t.1).min().unwrap_or(0);
    let last = tasks.iter().map(|t| t.2).max().unwrap_or(-1);
    let (start_ns, end_ns) = ns(first, last);

    let phases: Vec<Value> = tasks
        .iter()
        .map(|&(id, first, last)| {
            let (start_ns, end_ns) = ns(first, last);
            json!({ "type": "task", "instance": id, "start_ns": start_ns, "end_ns": end_ns })
        })
        .collect();

    let mut boundaries_ns = Vec::new();
    let mut values = Vec::new();
    for (i, &(first, last, value)) in cpu.iter().enumerate() {
        if i == 0 {
            boundaries_ns.push(first * NS_PER_TIMESLICE);
        }
        boundaries_ns.push((last + 1) * NS_PER_TIMESLICE);
        values.push(value);
    }
    let blocked_ns: Vec<Value> = gc
        .iter()
        .map(|&(first, last)| json!([first * NS_PER_TIMESLICE, (last + 1) * NS_PER_TIMESLICE - 1]))
        .collect();

    json!({
        "phase_types": [{ "path": "/task", "instance_key": "id", "interchangeable": true }],
        "execution": { "start_ns": start_ns, "end_ns": end_ns, "phases": phases },
        "resources": [
            { "name": "node", "metrics": [
                { "name": "cpu", "type": "cpu", "class": "consumable", "capacity": 10.0,
                  "boundaries_ns": boundaries_ns, "values": values },
                { "name": "gc", "type": "gc", "class": "blocking", "blocked_ns": blocked_ns }
            ] }
        ],
        "rules": [
            { "phase_type": "/task", "metric_type": "cpu", "consumable": { "exact": 4.0 } },
            { "phase_type": "/task", "metric_type": "gc", "blocking": "full" }
        ]
    })
}

pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}
