//! Item conservation across a realistic multi-stage topology.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use girder::cancel::CancelToken;
use girder::pipeline::{Item, Pipeline, PipelineConfig, StageOptions};
use girder::value::Value;

fn item(id: u64) -> Item {
    Item::new(id, Value::Str(format!("payload-{id}")))
}

#[test]
fn conservation_without_drops() {
    let sunk = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = Pipeline::new(PipelineConfig {
        default_buffer_size: 16,
        ..PipelineConfig::default()
    });

    pipeline
        .add_stage(
            "parse",
            4,
            |item| Ok(vec![item.with_attr("parsed", Value::Bool(true))]),
            StageOptions::default(),
        )
        .expect("add parse");
    // The filter drops odd ids (zero outputs) and splits even ids in two.
    pipeline
        .add_stage(
            "split",
            2,
            |item| {
                if item.id % 2 == 1 {
                    return Ok(Vec::new());
                }
                let copy = item.clone();
                Ok(vec![item, copy])
            },
            StageOptions::default(),
        )
        .expect("add split");
    let sink = Arc::clone(&sunk);
    pipeline
        .add_stage(
            "sink",
            1,
            move |item| {
                sink.lock().unwrap().push(item);
                Ok(Vec::new())
            },
            StageOptions::default(),
        )
        .expect("add sink");
    pipeline.connect("parse", "split").expect("connect");
    pipeline.connect("split", "sink").expect("connect");

    pipeline.start(CancelToken::new()).expect("start");
    pipeline.push((0..500).map(item)).expect("push");
    pipeline.drain().expect("drain");

    let stats = pipeline.stats();
    assert_eq!(stats.stage("parse").unwrap().processed, 500);
    assert_eq!(stats.stage("split").unwrap().processed, 500);
    // 250 even ids duplicated into 500 sink items.
    let sink_stats = stats.stage("sink").unwrap();
    assert_eq!(sink_stats.processed + sink_stats.errors, 500);
    assert_eq!(sunk.lock().unwrap().len(), 500);
    assert!(sink_stats.p99_latency_ms >= sink_stats.p50_latency_ms);
}

#[test]
fn losses_equal_dropped_counters() {
    let mut pipeline = Pipeline::new(PipelineConfig::default());
    pipeline
        .add_stage("source", 2, |item| Ok(vec![item]), StageOptions::default())
        .expect("add source");
    pipeline
        .add_stage(
            "slow",
            1,
            |item| {
                std::thread::sleep(Duration::from_millis(3));
                Ok(vec![item])
            },
            StageOptions {
                buffer_size: Some(2),
                drop_on_full: true,
            },
        )
        .expect("add slow");
    pipeline
        .add_stage("sink", 1, |_| Ok(Vec::new()), StageOptions::default())
        .expect("add sink");
    pipeline.connect("source", "slow").expect("connect");
    pipeline.connect("slow", "sink").expect("connect");

    pipeline.start(CancelToken::new()).expect("start");
    pipeline.push((0..200).map(item)).expect("push");
    pipeline.drain().expect("drain");

    let stats = pipeline.stats();
    let slow = stats.stage("slow").unwrap();
    let sink = stats.stage("sink").unwrap();
    assert_eq!(
        slow.processed + slow.dropped,
        200,
        "every item is processed or counted as dropped"
    );
    assert_eq!(sink.processed, slow.processed);
    assert!(slow.dropped > 0, "a 3ms stage behind a 2-slot buffer must drop");
}
