use serde_json::json;
use swarm_engine::engine::SENTINEL_REJECTED;
use swarm_engine::store::{Ticket, TicketState, WorkStore};
use swarm_engine::testing::{
    exec_success, run_until_settled, MockEnvironmentDriver, RecordingMerger, ScriptedJudge,
    TestHarness,
};

const PR: &str = "https://github.com/acme/app/pull/7";

fn reviewed_harness() -> TestHarness {
    let driver = MockEnvironmentDriver::new().on_exec(|req| {
        req.write_output(&json!({"summary": "implemented"}));
        Ok(exec_success(""))
    });
    let mut harness = TestHarness::with_driver(driver);
    harness.engine_config.sentinel.enabled = true;
    harness.agent("coder");
    harness
}

fn pr_ticket(id: &str) -> Ticket {
    let mut t = Ticket::new(id, "coder");
    t.branch_name = Some("feat/search".into());
    t.pr_url = Some(PR.into());
    t
}

#[tokio::test]
async fn test_verified_ticket_is_reviewed_and_merged() {
    let harness = reviewed_harness();
    harness.store.insert(pr_ticket("T-1")).await;

    let mut engine = harness.engine();
    run_until_settled(&mut engine, 100).await;

    let t = harness.store.get("T-1").await.unwrap().unwrap();
    assert_eq!(t.state, TicketState::Done);
    assert_eq!(t.verification_status.as_deref(), Some("merged"));
    assert_eq!(t.assignee_id.as_deref(), Some("sentinel"));
    assert_eq!(t.lease_id, None);
    assert_eq!(harness.merger.merged(), vec![PR.to_string()]);

    let requests = harness.judge.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].phases, vec!["sentinel".to_string()]);

    let events: Vec<String> = harness
        .store
        .events("T-1")
        .await
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    for expected in ["sent_to_review", "review_claimed", "merged"] {
        assert!(events.iter().any(|e| e == expected), "missing {}", expected);
    }
}

#[tokio::test]
async fn test_sentinel_rejection_escalates_to_a_human() {
    let mut harness = reviewed_harness();
    harness.judge = ScriptedJudge::new()
        .then_pass()
        .then_reject(["missing integration tests"]);
    harness.store.insert(pr_ticket("T-2")).await;

    let mut engine = harness.engine();
    run_until_settled(&mut engine, 100).await;

    let t = harness.store.get("T-2").await.unwrap().unwrap();
    assert_eq!(t.state, TicketState::NeedsReview);
    assert_eq!(t.verification_status.as_deref(), Some(SENTINEL_REJECTED));
    assert!(t.hold_reason.unwrap().contains("missing integration tests"));
    assert!(t.sentinel_feedback.is_some());
    assert!(harness.merger.merged().is_empty());
}

#[tokio::test]
async fn test_failed_merge_escalates() {
    let mut harness = reviewed_harness();
    harness.merger = RecordingMerger::failing("merge conflict in src/lib.rs");
    harness.store.insert(pr_ticket("T-3")).await;

    let mut engine = harness.engine();
    run_until_settled(&mut engine, 100).await;

    let t = harness.store.get("T-3").await.unwrap().unwrap();
    assert_eq!(t.state, TicketState::NeedsReview);
    assert!(t.hold_reason.unwrap().contains("merge failed"));
    assert_eq!(harness.merger.merged(), vec![PR.to_string()]);
}

#[tokio::test]
async fn test_ticket_without_pull_request_needs_review() {
    let harness = reviewed_harness();
    let mut t = pr_ticket("T-4");
    t.pr_url = None;
    harness.store.insert(t).await;

    let mut engine = harness.engine();
    run_until_settled(&mut engine, 100).await;

    let t = harness.store.get("T-4").await.unwrap().unwrap();
    assert_eq!(t.state, TicketState::NeedsReview);
    assert_eq!(t.hold_reason.as_deref(), Some("no pull request to review"));
    assert_eq!(harness.judge.requests().len(), 1);
}

#[tokio::test]
async fn test_disabled_sentinel_completes_without_merging() {
    let mut harness = reviewed_harness();
    harness.engine_config.sentinel.enabled = false;
    harness.store.insert(pr_ticket("T-5")).await;

    let mut engine = harness.engine();
    run_until_settled(&mut engine, 100).await;

    let t = harness.store.get("T-5").await.unwrap().unwrap();
    assert_eq!(t.state, TicketState::Done);
    assert_eq!(t.verification_status.as_deref(), Some("passed"));
    assert!(harness.merger.merged().is_empty());
}
