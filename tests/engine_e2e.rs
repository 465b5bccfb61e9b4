#![cfg(unix)]

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde_json::json;
use tempfile::TempDir;

use scriptdeck::core::store::types::{
    AlertRuleKind, ExecStatus, ExecutionRecord, NotifyKind, OutputMode,
};
use scriptdeck::{EngineConfig, ExecTarget, ExecutionEngine, InterpreterKind, Store};

fn engine_with_timeout(timeout_secs: u64) -> ExecutionEngine {
    let mut config = EngineConfig::default();
    config.execution.timeout_secs = timeout_secs;
    config.execution.stop_grace_ms = 100;
    ExecutionEngine::with_store(Store::open_in_memory().unwrap(), config)
}

fn write_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, body).unwrap();
    path
}

async fn register(engine: &ExecutionEngine, name: &str, path: &PathBuf) -> i64 {
    let id = engine
        .store()
        .create_script(name, "", InterpreterKind::Shell, OutputMode::Text, None)
        .await
        .unwrap();
    engine
        .store()
        .update_script_path(id, &path.to_string_lossy())
        .await
        .unwrap();
    id
}

async fn wait_terminal(engine: &ExecutionEngine, execution_id: i64) -> ExecutionRecord {
    for _ in 0..200 {
        let record = engine.get_execution(execution_id).await.unwrap();
        if record.status.is_terminal() {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("execution {execution_id} never reached a terminal state");
}

#[tokio::test]
async fn single_script_runs_to_completion_with_output() {
    let dir = tempfile::tempdir().unwrap();
    // Reads n out of the parameter envelope handed as argv[1], doubles it.
    let script = write_script(
        &dir,
        "double.sh",
        r#"#!/bin/bash
n=$(grep -o '"n":[0-9]*' "$1" | head -1 | cut -d: -f2)
echo "{\"result\": $((n * 2))}"
"#,
    );
    let engine = engine_with_timeout(30);
    let script_id = register(&engine, "double", &script).await;

    let execution_id = engine
        .submit(ExecTarget::Script(script_id), json!({"n": 21}))
        .await
        .unwrap();
    let record = wait_terminal(&engine, execution_id).await;

    assert_eq!(record.status, ExecStatus::Completed);
    assert!(record.output.unwrap().contains("\"result\": 42"));
    assert!(record.error.is_none());
    assert!(record.end_time.is_some());

    // The params snapshot keeps what the script saw, dispatch stamp included.
    let params = record.params.unwrap();
    assert_eq!(params["user_params"]["n"], 21);
    assert!(params["system_params"]["__execution_time"].is_string());
}

#[tokio::test]
async fn chain_relays_stdout_between_steps() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_script(&dir, "first.sh", "#!/bin/bash\necho alpha\n");
    // Echo back whatever the previous step printed, via the reserved key.
    let second = write_script(
        &dir,
        "second.sh",
        r#"#!/bin/bash
prev=$(grep -o '"__prev_output":"[^"]*"' "$1" | cut -d'"' -f4)
echo "got:$prev"
"#,
    );
    let engine = engine_with_timeout(30);
    let first_id = register(&engine, "first", &first).await;
    let second_id = register(&engine, "second", &second).await;

    let chain_id = engine.store().create_chain("relay", "").await.unwrap();
    engine.store().add_chain_node(chain_id, first_id, 1).await.unwrap();
    engine.store().add_chain_node(chain_id, second_id, 2).await.unwrap();

    let execution_id = engine
        .submit(ExecTarget::Chain(chain_id), json!(null))
        .await
        .unwrap();
    let record = wait_terminal(&engine, execution_id).await;

    assert_eq!(record.status, ExecStatus::Completed);
    let outputs: serde_json::Value =
        serde_json::from_str(&record.output.unwrap()).unwrap();
    assert_eq!(outputs[first_id.to_string()], "alpha\n");
    // The newline of the relayed stdout travels inside the JSON string; the
    // shell pipeline above only captures up to the first quote-free run, so
    // the marker proves the relay happened.
    assert!(
        outputs[second_id.to_string()]
            .as_str()
            .unwrap()
            .starts_with("got:alpha")
    );
}

#[tokio::test]
async fn mid_chain_progress_keeps_earlier_step_output() {
    let dir = tempfile::tempdir().unwrap();
    let quick = write_script(&dir, "quick.sh", "#!/bin/bash\necho one\n");
    let slow = write_script(&dir, "slow.sh", "#!/bin/bash\nsleep 2\necho two\n");
    let engine = engine_with_timeout(30);
    let quick_id = register(&engine, "quick", &quick).await;
    let slow_id = register(&engine, "slow", &slow).await;

    let chain_id = engine.store().create_chain("staggered", "").await.unwrap();
    engine.store().add_chain_node(chain_id, quick_id, 1).await.unwrap();
    engine.store().add_chain_node(chain_id, slow_id, 2).await.unwrap();

    let execution_id = engine
        .submit(ExecTarget::Chain(chain_id), json!(null))
        .await
        .unwrap();

    // While step two is still sleeping, the progress snapshot must carry
    // step one's output alongside the running-step banner.
    let mut saw_mid_chain = false;
    for _ in 0..100 {
        let record = engine.get_execution(execution_id).await.unwrap();
        if let Some(output) = record.output
            && output.contains("running step 2")
        {
            assert!(output.contains("one"), "step one's output was dropped: {output}");
            saw_mid_chain = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(saw_mid_chain, "never observed the mid-chain progress snapshot");

    let record = wait_terminal(&engine, execution_id).await;
    assert_eq!(record.status, ExecStatus::Completed);
    let outputs: serde_json::Value =
        serde_json::from_str(&record.output.unwrap()).unwrap();
    assert_eq!(outputs[quick_id.to_string()], "one\n");
    assert_eq!(outputs[slow_id.to_string()], "two\n");
}

#[tokio::test]
async fn chain_stops_at_the_failing_step() {
    let dir = tempfile::tempdir().unwrap();
    let ok = write_script(&dir, "ok.sh", "#!/bin/bash\necho fine\n");
    let bad = write_script(&dir, "bad.sh", "#!/bin/bash\necho broke >&2\nexit 2\n");
    let marker = dir.path().join("third-ran");
    let third = write_script(
        &dir,
        "third.sh",
        &format!("#!/bin/bash\ntouch {}\n", marker.display()),
    );

    let engine = engine_with_timeout(30);
    let ok_id = register(&engine, "ok", &ok).await;
    let bad_id = register(&engine, "bad", &bad).await;
    let third_id = register(&engine, "third", &third).await;

    let chain_id = engine.store().create_chain("brittle", "").await.unwrap();
    engine.store().add_chain_node(chain_id, ok_id, 1).await.unwrap();
    engine.store().add_chain_node(chain_id, bad_id, 2).await.unwrap();
    engine.store().add_chain_node(chain_id, third_id, 3).await.unwrap();

    let execution_id = engine
        .submit(ExecTarget::Chain(chain_id), json!(null))
        .await
        .unwrap();
    let record = wait_terminal(&engine, execution_id).await;

    assert_eq!(record.status, ExecStatus::Failed);
    let error = record.error.unwrap();
    assert!(error.contains("step 2"));
    assert!(error.contains("broke"));

    // Step one's output is preserved in the aggregate; step three never ran.
    let outputs: serde_json::Value =
        serde_json::from_str(&record.output.unwrap()).unwrap();
    assert_eq!(outputs[ok_id.to_string()], "fine\n");
    assert!(outputs.get(third_id.to_string()).is_none());
    assert!(!marker.exists());
}

#[tokio::test]
async fn watchdog_fails_a_hung_execution_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "hang.sh", "#!/bin/bash\nsleep 30\n");
    let engine = engine_with_timeout(1);
    let script_id = register(&engine, "hang", &script).await;

    let started = Instant::now();
    let execution_id = engine
        .submit(ExecTarget::Script(script_id), json!({}))
        .await
        .unwrap();
    let record = wait_terminal(&engine, execution_id).await;

    assert_eq!(record.status, ExecStatus::Failed);
    assert!(record.error.unwrap().contains("timed out after 1 seconds"));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(record.duration_secs.unwrap() < 5.0);
}

#[tokio::test]
async fn stop_terminates_a_running_execution_once() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "hang.sh", "#!/bin/bash\nsleep 30\n");
    let engine = engine_with_timeout(60);
    let script_id = register(&engine, "hang", &script).await;

    let execution_id = engine
        .submit(ExecTarget::Script(script_id), json!({}))
        .await
        .unwrap();
    // Give the worker a moment to actually spawn the child.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(engine.stop(execution_id).await.unwrap());
    let record = wait_terminal(&engine, execution_id).await;
    assert_eq!(record.status, ExecStatus::Failed);
    assert!(record.error.unwrap().contains("manually terminated"));

    // Stopping again changes nothing.
    assert!(!engine.stop(execution_id).await.unwrap());

    // A straggler flush from the dying worker cannot reopen the record.
    let again = engine.get_execution(execution_id).await.unwrap();
    assert_eq!(again.status, ExecStatus::Failed);
}

#[tokio::test]
async fn terminal_execution_fires_matching_alert_rules() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "quick.sh", "#!/bin/bash\nsleep 0.1\necho ok\n");
    let engine = engine_with_timeout(30);
    let script_id = register(&engine, "quick", &script).await;

    // Fires on any completed run; there is no SMTP configured, so delivery
    // is recorded as failed but still recorded.
    engine
        .store()
        .create_alert_rule(
            "any completion",
            AlertRuleKind::DurationExceeds,
            "0",
            NotifyKind::Email,
            &json!({"recipients": ["ops@example.com"]}),
        )
        .await
        .unwrap();

    let execution_id = engine
        .submit(ExecTarget::Script(script_id), json!({}))
        .await
        .unwrap();
    let record = wait_terminal(&engine, execution_id).await;
    assert_eq!(record.status, ExecStatus::Completed);

    // The evaluator runs before the worker exits; give it a beat.
    let mut deliveries = Vec::new();
    for _ in 0..100 {
        deliveries = engine.store().list_deliveries(10).await.unwrap();
        if !deliveries.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].execution_id, execution_id);
    assert_eq!(deliveries[0].outcome, "failed");
}

#[tokio::test]
async fn published_body_is_what_gets_executed() {
    let scripts_dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::default();
    config.storage.scripts_dir = scripts_dir.path().to_path_buf();
    let engine = ExecutionEngine::with_store(Store::open_in_memory().unwrap(), config);

    let script_id = engine
        .store()
        .create_script("versioned", "", InterpreterKind::Shell, OutputMode::Text, None)
        .await
        .unwrap();

    let v1 = engine
        .publish_version(script_id, "#!/bin/bash\necho one\n", None, false)
        .await
        .unwrap();
    // Identical body: same version comes back, nothing new written.
    let v1_again = engine
        .publish_version(script_id, "#!/bin/bash\necho one\n", None, false)
        .await
        .unwrap();
    assert_eq!(v1, v1_again);

    let v2 = engine
        .publish_version(script_id, "#!/bin/bash\necho two\n", None, false)
        .await
        .unwrap();
    assert_ne!(v1, v2);

    let execution_id = engine
        .submit(ExecTarget::Script(script_id), json!({}))
        .await
        .unwrap();
    let record = wait_terminal(&engine, execution_id).await;
    assert_eq!(record.status, ExecStatus::Completed);
    assert_eq!(record.output.unwrap(), "two\n");

    let diff = engine.versions().diff_versions(v1, v2).await.unwrap();
    assert!(diff.contains("- echo one"));
    assert!(diff.contains("+ echo two"));
}

#[tokio::test]
async fn duration_matches_the_recorded_window() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "nap.sh", "#!/bin/bash\nsleep 1\n");
    let engine = engine_with_timeout(30);
    let script_id = register(&engine, "nap", &script).await;

    let execution_id = engine
        .submit(ExecTarget::Script(script_id), json!({}))
        .await
        .unwrap();
    let record = wait_terminal(&engine, execution_id).await;

    assert_eq!(record.status, ExecStatus::Completed);
    let duration = record.duration_secs.unwrap();
    assert!(duration >= 1.0, "duration {duration} shorter than the sleep");
    let window = (record.end_time.unwrap() - record.start_time).num_milliseconds() as f64 / 1000.0;
    assert!((window - duration).abs() < 0.05);
}
