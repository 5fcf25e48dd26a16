//! Synthetic jobs shared by the benchmarks

use phaselens::job::{JobDescription, LoadedJob};
use phaselens::time::Time;
use serde_json::{json, Value};

/// Nanoseconds per timeslice of the synthetic jobs
pub const NS_PER_TIMESLICE: i64 = 10;

const STAGE_LENGTH: i64 = 100;

/// `stages` chained stages of `tasks_per_stage` overlapping tasks on one node
///
/// At most four tasks of a stage run at once. The cpu is sampled every ten
/// timeslices and gc blocks one timeslice in every 37.
///
/// # Panics
///
/// Panics if the generated description fails to load.
pub fn staged_job(stages: i64, tasks_per_stage: i64) -> LoadedJob {
    let ns = |timeslice: i64| timeslice * NS_PER_TIMESLICE;

    let stage_phases: Vec<Value> = (0..stages)
        .map(|s| {
            let offset = s * STAGE_LENGTH;
            let tasks: Vec<Value> = (0..tasks_per_stage)
                .map(|k| {
                    // Task 0 spans the stage so subphases leave no gaps
                    let (start, end) = if k == 0 {
                        (offset, offset + STAGE_LENGTH)
                    } else {
                        let start = offset + (k % 5) * 5;
                        (start, start + 20 + (k % 7) * 5)
                    };
                    json!({ "type": "task", "instance": k.to_string(),
                            "start_ns": ns(start), "end_ns": ns(end) })
                })
                .collect();
            let depends_on: Vec<String> = if s == 0 {
                Vec::new()
            } else {
                vec![format!("stage[id={}]", s - 1)]
            };
            json!({ "type": "stage", "instance": s.to_string(),
                    "start_ns": ns(offset), "end_ns": ns(offset + STAGE_LENGTH),
                    "depends_on": depends_on, "phases": tasks })
        })
        .collect();

    let end = stages * STAGE_LENGTH;
    let boundaries_ns: Vec<i64> = (0..=end / 10).map(|i| ns(i * 10)).collect();
    let values: Vec<f64> = (0..end / 10)
        .map(|i| [3.5, 3.9, 2.0, 4.0][(i % 4) as usize])
        .collect();
    let blocked_ns: Vec<[i64; 2]> = (0..end / 37)
        .map(|i| [ns(i * 37), ns(i * 37 + 1) - 1])
        .collect();

    let description = json!({
        "phase_types": [
            { "path": "/stage", "instance_key": "id" },
            { "path": "/stage/task", "instance_key": "id", "interchangeable": true }
        ],
        "execution": { "start_ns": 0, "end_ns": ns(end), "phases": stage_phases },
        "resources": [
            { "name": "node", "metrics": [
                { "name": "cpu", "type": "cpu", "class": "consumable", "capacity": 4.0,
                  "boundaries_ns": boundaries_ns, "values": values },
                { "name": "gc", "type": "gc", "class": "blocking", "blocked_ns": blocked_ns }
            ] }
        ],
        "rules": [
            { "phase_type": "/stage/task", "metric_type": "cpu", "consumable": { "variable": 1.0 } },
            { "phase_type": "/stage/task", "metric_type": "gc", "blocking": "full" }
        ],
        "constraints": [
            { "per_instance_type": "/stage", "constrained_type": "/stage/task", "limit": 4 }
        ]
    });

    let time = Time::new(NS_PER_TIMESLICE).expect("positive timeslice length");
    JobDescription::from_json(&description.to_string())
        .and_then(|d| d.load(time))
        .expect("synthetic job is valid")
}
