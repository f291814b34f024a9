//! End-to-end scheduling scenarios against in-memory collaborators

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use swarm_engine::lease::SlotState;
use swarm_engine::sequencer::StepSpec;
use swarm_engine::store::{Ticket, TicketState, WorkStore};
use swarm_engine::testing::{
    exec_failure, exec_success, run_until_settled, MockEnvironmentDriver, ScriptedJudge,
    TestHarness,
};

async fn ticket(harness: &TestHarness, id: &str) -> Ticket {
    harness.store.get(id).await.unwrap().unwrap()
}

async fn event_types(harness: &TestHarness, id: &str) -> Vec<String> {
    harness
        .store
        .events(id)
        .await
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

fn assert_all_slots_free(harness: &TestHarness) {
    for status in harness.pool.status().unwrap() {
        assert!(
            !matches!(status.state, SlotState::Held(_)),
            "slot {} still held",
            status.slot
        );
    }
}

/// Driver whose agent echoes its input back and records every input it saw
fn echo_driver(seen: Arc<Mutex<Vec<Value>>>) -> MockEnvironmentDriver {
    MockEnvironmentDriver::new().on_exec(move |req| {
        let input = req.read_input().unwrap_or(Value::Null);
        seen.lock().unwrap().push(input.clone());
        req.write_output(&json!({"echo": input["task"], "attempt": input["attempt"]}));
        Ok(exec_success("ok"))
    })
}

#[tokio::test]
async fn test_happy_path_leased_ticket_is_done() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let harness = TestHarness::with_driver(echo_driver(seen.clone()));
    harness.agent("coder");

    let mut t = Ticket::new("T-1", "coder");
    t.inputs = json!({"task": "add login"});
    t.branch_name = Some("feat/login".into());
    t.acceptance_criteria = vec!["login page renders".into()];
    harness.store.insert(t).await;

    let mut engine = harness.engine();
    run_until_settled(&mut engine, 100).await;

    let done = ticket(&harness, "T-1").await;
    assert_eq!(done.state, TicketState::Done);
    assert_eq!(done.verification_status.as_deref(), Some("passed"));
    assert_eq!(done.lease_id, None);
    assert!(done.completed_at.is_some());
    let outputs = done.outputs.unwrap();
    assert_eq!(outputs["echo"], json!("add login"));
    assert_eq!(outputs["attempt"], json!(1));

    let requests = harness.judge.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].branch_name, "feat/login");
    assert_eq!(requests[0].attempt, 1);
    assert_eq!(requests[0].acceptance_criteria, vec!["login page renders"]);

    let events = event_types(&harness, "T-1").await;
    assert!(events.contains(&"claimed".to_string()));
    assert!(events.contains(&"verification_started".to_string()));
    assert!(events.contains(&"completed".to_string()));

    assert_eq!(seen.lock().unwrap()[0]["ticket"]["id"], json!("T-1"));
    assert_all_slots_free(&harness);
}

#[tokio::test]
async fn test_rejections_retry_with_feedback_then_hold() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut harness = TestHarness::with_driver(echo_driver(seen.clone()));
    harness.judge = ScriptedJudge::new()
        .then_reject(["tests fail on CI"])
        .then_reject(["lint errors remain"])
        .then_reject(["still failing"]);
    harness.agent("coder");

    let mut t = Ticket::new("T-2", "coder");
    t.branch_name = Some("feat/x".into());
    harness.store.insert(t).await;

    let mut engine = harness.engine();
    run_until_settled(&mut engine, 200).await;

    let held = ticket(&harness, "T-2").await;
    assert_eq!(held.state, TicketState::OnHold);
    assert_eq!(held.retry_count, 3);
    assert_eq!(held.verification_status.as_deref(), Some("failed"));
    assert!(held.hold_reason.unwrap().contains("3 of 3"));

    let attempts: Vec<u32> = harness.judge.requests().iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let inputs = seen.lock().unwrap().clone();
    assert_eq!(inputs.len(), 3);
    assert!(inputs[0].get("feedback").is_none());
    let second = inputs[1]["feedback"].as_str().unwrap();
    assert!(second.contains("Attempt 1 of 3"));
    assert!(second.contains("tests fail on CI"));
    assert!(inputs[2]["feedback"]
        .as_str()
        .unwrap()
        .contains("lint errors remain"));

    let events = event_types(&harness, "T-2").await;
    let retries = events.iter().filter(|e| *e == "retry_scheduled").count();
    assert_eq!(retries, 2);
    assert_eq!(events.last().map(String::as_str), Some("put_on_hold"));
    assert_all_slots_free(&harness);
}

#[tokio::test]
async fn test_agent_failure_counts_as_rejection() {
    let driver = MockEnvironmentDriver::new().on_exec(|_| Ok(exec_failure(2, "boom: missing file")));
    let harness = TestHarness::with_driver(driver);
    harness.agent("coder");
    let mut t = Ticket::new("T-3", "coder");
    t.branch_name = Some("feat/y".into());
    harness.store.insert(t).await;

    let mut engine = harness.engine();
    run_until_settled(&mut engine, 200).await;

    let held = ticket(&harness, "T-3").await;
    assert_eq!(held.state, TicketState::OnHold);
    assert_eq!(held.retry_count, 3);
    assert!(harness.judge.requests().is_empty());
    let evidence = held.evidence.unwrap();
    assert_eq!(evidence["exit_code"], json!(2));
    assert!(evidence["stderr_tail"].as_str().unwrap().contains("boom"));
    let feedback = held.sentinel_feedback.unwrap();
    assert!(feedback["instructions"]
        .as_str()
        .unwrap()
        .contains("agent exited with code 2"));
}

#[tokio::test]
async fn test_unknown_agent_is_held_as_structural_error() {
    let harness = TestHarness::new();
    harness.store.insert(Ticket::new("T-4", "ghost")).await;

    let mut engine = harness.engine();
    run_until_settled(&mut engine, 50).await;

    let held = ticket(&harness, "T-4").await;
    assert_eq!(held.state, TicketState::OnHold);
    assert_eq!(held.retry_count, 0);
    assert!(held.hold_reason.unwrap().starts_with("structural error"));
    assert_eq!(held.evidence.unwrap()["structural"], json!(true));
    assert_eq!(harness.driver.spawn_count(), 0);
}

#[tokio::test]
async fn test_transfer_failure_cancels_without_consuming_retry() {
    let driver = MockEnvironmentDriver::new()
        .with_failing_push()
        .on_exec(|_| Ok(exec_success("")));
    let harness = TestHarness::with_driver(driver);
    harness.agent("coder");
    harness.store.insert(Ticket::new("T-5", "coder")).await;

    let mut engine = harness.engine();
    run_until_settled(&mut engine, 50).await;

    let cancelled = ticket(&harness, "T-5").await;
    assert_eq!(cancelled.state, TicketState::Cancelled);
    assert_eq!(cancelled.retry_count, 0);
    assert_eq!(cancelled.lease_id, None);
    assert!(cancelled
        .hold_reason
        .unwrap()
        .starts_with("infrastructure error"));
    assert_eq!(cancelled.evidence.unwrap()["structural"], json!(false));
    assert_all_slots_free(&harness);
}

#[tokio::test]
async fn test_judge_outage_cancels_after_retries() {
    let mut harness = TestHarness::new();
    harness.judge = ScriptedJudge::new()
        .then_unavailable("connection refused")
        .then_unavailable("connection refused");
    harness.agent("coder");
    harness.driver.clone().on_exec(|req| {
        req.write_output(&json!({"ok": true}));
        Ok(exec_success(""))
    });
    let mut t = Ticket::new("T-6", "coder");
    t.branch_name = Some("feat/z".into());
    harness.store.insert(t).await;

    let mut engine = harness.engine();
    run_until_settled(&mut engine, 50).await;

    let cancelled = ticket(&harness, "T-6").await;
    assert_eq!(cancelled.state, TicketState::Cancelled);
    assert_eq!(cancelled.retry_count, 0);
    assert_eq!(harness.judge.requests().len(), 2);
}

#[tokio::test]
async fn test_ticket_without_branch_skips_verification() {
    let harness = TestHarness::new();
    harness.agent("coder");
    harness.driver.clone().on_exec(|req| {
        req.write_output(&json!({"ok": true}));
        Ok(exec_success(""))
    });
    harness.store.insert(Ticket::new("T-7", "coder")).await;

    let mut engine = harness.engine();
    run_until_settled(&mut engine, 50).await;

    let done = ticket(&harness, "T-7").await;
    assert_eq!(done.state, TicketState::Done);
    assert_eq!(done.verification_status.as_deref(), Some("skipped"));
    assert!(harness.judge.requests().is_empty());
}

#[tokio::test]
async fn test_dependent_ticket_runs_after_prerequisite() {
    let harness = TestHarness::new();
    harness.agent("coder");
    harness.driver.clone().on_exec(|req| {
        req.write_output(&json!({"ok": true}));
        Ok(exec_success(""))
    });
    harness.store.insert(Ticket::new("T-8", "coder")).await;
    let mut blocked = Ticket::new("T-9", "coder");
    blocked.state = TicketState::Blocked;
    blocked.depends_on = vec!["T-8".into()];
    harness.store.insert(blocked).await;

    let mut engine = harness.engine();
    let first = engine.poll_once().await.unwrap();
    assert_eq!(first.dispatched, vec!["T-8".to_string()]);
    assert!(first.promoted.is_empty());

    run_until_settled(&mut engine, 100).await;

    assert_eq!(ticket(&harness, "T-8").await.state, TicketState::Done);
    assert_eq!(ticket(&harness, "T-9").await.state, TicketState::Done);
    let events = event_types(&harness, "T-9").await;
    assert_eq!(events.first().map(String::as_str), Some("unblocked"));
}

#[tokio::test]
async fn test_workflow_ticket_fans_out_and_in() {
    let driver = MockEnvironmentDriver::new().on_exec(|req| {
        let agent = req.env_value("SWARM_AGENT").unwrap_or_default();
        let input = req.read_input().unwrap_or(Value::Null);
        let output = match agent.as_str() {
            "merger" => {
                let mut seen: Vec<String> = input["deps"]
                    .as_object()
                    .map(|deps| deps.keys().cloned().collect())
                    .unwrap_or_default();
                seen.sort();
                json!({"merged": seen})
            }
            other => json!({"by": other, "topic": input["topic"]}),
        };
        req.write_output(&output);
        Ok(exec_success(""))
    });
    let harness = TestHarness::with_driver(driver);
    for name in ["planner", "writer", "merger"] {
        harness.agent(name);
    }

    let mut t = Ticket::new("T-10", "planner");
    t.inputs = json!({"topic": "caching"});
    t.workflow = Some(vec![
        StepSpec::new("plan", "planner").with_inputs(json!({"topic": "${topic}"})),
        StepSpec::new("draft_a", "writer")
            .depends_on(["plan"])
            .with_inputs(json!({"topic": "${steps.plan.topic}"})),
        StepSpec::new("draft_b", "writer")
            .depends_on(["plan"])
            .with_inputs(json!({"topic": "${steps.plan.topic}"})),
        StepSpec::new("merge", "merger").depends_on(["draft_a", "draft_b"]),
    ]);
    harness.store.insert(t).await;

    let mut engine = harness.engine();
    run_until_settled(&mut engine, 100).await;

    let done = ticket(&harness, "T-10").await;
    assert_eq!(done.state, TicketState::Done);
    let outputs = done.outputs.unwrap();
    assert_eq!(outputs["run_id"], json!("T-10-1"));
    assert_eq!(outputs["steps"]["draft_a"]["topic"], json!("caching"));
    assert_eq!(outputs["steps"]["merge"]["merged"], json!(["draft_a", "draft_b"]));

    let records = harness.store.steps().await;
    let mut recorded: Vec<&str> = records.iter().map(|r| r.step_id.as_str()).collect();
    recorded.sort();
    recorded.dedup();
    assert_eq!(recorded, vec!["draft_a", "draft_b", "merge", "plan"]);
    assert_all_slots_free(&harness);
}

#[tokio::test]
async fn test_exhausted_pool_requeues_instead_of_failing() {
    let driver = MockEnvironmentDriver::new()
        .with_exec_delay(Duration::from_millis(200))
        .on_exec(|req| {
            req.write_output(&json!({"ok": true}));
            Ok(exec_success(""))
        });
    let harness = TestHarness::with_lease_config(driver, |lease| {
        lease.pool_size = 1;
        lease.max_slot_index = 1;
    });
    harness.agent("coder");
    harness.store.insert(Ticket::new("T-11", "coder")).await;
    harness.store.insert(Ticket::new("T-12", "coder")).await;

    let mut engine = harness.engine();
    run_until_settled(&mut engine, 300).await;

    for id in ["T-11", "T-12"] {
        let t = ticket(&harness, id).await;
        assert_eq!(t.state, TicketState::Done, "{} should finish", id);
        assert_eq!(t.retry_count, 0);
    }
    let requeued = event_types(&harness, "T-11")
        .await
        .into_iter()
        .chain(event_types(&harness, "T-12").await)
        .filter(|e| e == "requeued")
        .count();
    assert!(requeued >= 1);
    assert_all_slots_free(&harness);
}

#[tokio::test]
async fn test_requeued_ticket_waits_out_the_pool_backoff() {
    let driver = MockEnvironmentDriver::new()
        .with_failing_spawn(1)
        .with_failing_spawn(2);
    let mut harness = TestHarness::with_driver(driver);
    harness.engine_config.pool_backoff = Duration::from_secs(30);
    harness.agent("coder");
    harness.store.insert(Ticket::new("T-13", "coder")).await;

    let mut engine = harness.engine();
    for _ in 0..20 {
        engine.poll_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let claims = event_types(&harness, "T-13")
        .await
        .into_iter()
        .filter(|e| e == "claimed")
        .count();
    assert_eq!(claims, 1);
    let t = ticket(&harness, "T-13").await;
    assert_eq!(t.state, TicketState::Ready);
    assert_eq!(t.retry_count, 0);
    assert!(t.retry_after.unwrap() > chrono::Utc::now());
    assert_all_slots_free(&harness);
}

#[tokio::test]
async fn test_two_engines_never_run_the_same_ticket() {
    let mut harness = TestHarness::new();
    // one ticket per engine keeps both within the two slots
    harness.engine_config.max_concurrent = 1;
    harness.agent("coder");
    let runs = Arc::new(Mutex::new(Vec::new()));
    let seen = runs.clone();
    harness.driver.clone().on_exec(move |req| {
        let input = req.read_input().unwrap_or(Value::Null);
        seen.lock()
            .unwrap()
            .push(input["ticket"]["id"].as_str().unwrap_or_default().to_string());
        req.write_output(&json!({"ok": true}));
        Ok(exec_success(""))
    });
    let ids: Vec<String> = (1..=6).map(|i| format!("T-{:02}", i)).collect();
    for id in &ids {
        harness.store.insert(Ticket::new(id.as_str(), "coder")).await;
    }

    let mut first = harness.engine();
    let mut second = harness.engine();
    let (a, b) = tokio::join!(first.poll_once(), second.poll_once());
    let (a, b) = (a.unwrap(), b.unwrap());
    for id in &a.dispatched {
        assert!(!b.dispatched.contains(id), "{} dispatched twice", id);
    }

    for _ in 0..300 {
        let a = first.poll_once().await.unwrap();
        let b = second.poll_once().await.unwrap();
        if !a.dispatched_any()
            && !b.dispatched_any()
            && first.active_count() == 0
            && second.active_count() == 0
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let mut ran = runs.lock().unwrap().clone();
    ran.sort();
    assert_eq!(ran, ids);
    for id in &ids {
        let claims = event_types(&harness, id)
            .await
            .into_iter()
            .filter(|e| e == "claimed")
            .count();
        assert_eq!(claims, 1, "{} claimed {} times", id, claims);
    }
}

#[tokio::test]
async fn test_max_concurrent_bounds_dispatch() {
    let mut harness =
        TestHarness::with_driver(MockEnvironmentDriver::new().with_exec_delay(Duration::from_millis(100)));
    harness.engine_config.max_concurrent = 2;
    harness.agent("coder");
    for i in 1..=5 {
        harness
            .store
            .insert(Ticket::new(format!("T-{}", i), "coder"))
            .await;
    }

    let mut engine = harness.engine();
    let report = engine.poll_once().await.unwrap();
    assert_eq!(report.dispatched.len(), 2);
    let again = engine.poll_once().await.unwrap();
    assert!(again.dispatched.is_empty());
    assert_eq!(engine.active_count(), 2);

    engine.drain().await;
}
