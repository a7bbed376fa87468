use fiberchain::{Config, Job, JobSystem, PinningStrategy, timeline};

fn config(timeline: bool) -> Config {
    Config::default()
        .with_thread_count(2)
        .with_fiber_count(8)
        .with_stack_size(64 * 1024)
        .with_pinning(PinningStrategy::None)
        .with_timeline(timeline)
}

// One test: the collected events are process-wide.
#[test]
fn test_timeline_export_contains_job_spans() {
    JobSystem::launch(config(false), |ctx| {
        ctx.split_and_unchain([Job::new("untraced_work", |_ctx| {})]);
    })
    .unwrap();
    assert!(timeline::take_events().is_empty());

    JobSystem::launch(config(true), |ctx| {
        ctx.split_and_unchain((0..12).map(|_| {
            Job::new("traced_work", |_ctx| {
                std::hint::black_box((0..1000).sum::<u64>());
            })
        }));
    })
    .unwrap();

    let path = std::env::temp_dir().join(format!("fiberchain_trace_{}.json", std::process::id()));
    timeline::export_to_file(&path).unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    let events: Vec<serde_json::Value> = serde_json::from_str(&contents).unwrap();
    std::fs::remove_file(&path).ok();

    let traced: Vec<_> = events
        .iter()
        .filter(|e| e["name"] == "traced_work")
        .collect();
    assert_eq!(traced.len(), 12);
    for event in traced {
        assert_eq!(event["ph"], "X");
        assert!(event["tid"].as_u64().unwrap() < 2);
    }
    assert!(events.iter().any(|e| e["name"] == "main"));

    // Export drains the collection.
    assert!(timeline::take_events().is_empty());

    // A job still parked at teardown is unwound on the thread dropping the
    // system, after that thread handed its buffer over. Its span must not
    // show up in a later export.
    JobSystem::launch(config(true), |ctx| {
        let gate = ctx.acquire_chain();
        ctx.split([Job::new("parked_at_teardown", move |ctx| {
            ctx.unchain(Some(gate));
        })]);
    })
    .unwrap();
    JobSystem::launch(config(true), |_ctx| {}).unwrap();

    let events = timeline::take_events();
    assert!(events.iter().any(|e| e.name == "main"));
    assert!(events.iter().all(|e| e.name != "parked_at_teardown"));
}
