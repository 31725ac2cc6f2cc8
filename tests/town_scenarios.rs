use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use town::clock::ManualClock;
use town::config::{Settings, TownConfig};
use town::dispatch::ContainerStatus;
use town::dispatch::testing::FakeRuntime;
use town::error::TownError;
use town::host::TownHost;
use town::town::Town;
use town::types::{
    AgentRole, AgentStatus, BeadFilter, BeadStatus, ConvoyStatus, EscalationFilter, NewBead,
    NewEscalation, ReviewOutcome, ReviewStatus, Severity,
};

struct Fixture {
    town: Town,
    runtime: Arc<FakeRuntime>,
    clock: Arc<ManualClock>,
}

fn start() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-05-04T09:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.auth.token_secret = Some("scenario-secret".into());
    settings
}

fn fixture() -> Fixture {
    let runtime = Arc::new(FakeRuntime::new());
    let clock = Arc::new(ManualClock::new(start()));
    let town = Town::in_memory("town-scenario", "user-7", settings(), runtime.clone(), clock.clone())
        .unwrap();
    Fixture {
        town,
        runtime,
        clock,
    }
}

fn completed() -> ContainerStatus {
    ContainerStatus::Gone {
        reason: Some("completed".into()),
    }
}

#[test]
fn convoy_lands_when_worked_and_closed_beads_finish() {
    let mut f = fixture();
    let rig = f.town.add_rig("web", "https://git.example/web.git", "main").unwrap();
    let first = f
        .town
        .create_bead(&NewBead::task("add login page").rig(&rig.id))
        .unwrap();
    let second = f
        .town
        .create_bead(&NewBead::task("update docs").rig(&rig.id))
        .unwrap();
    let convoy = f
        .town
        .create_convoy(
            "login release",
            &[first.id.clone(), second.id.clone(), first.id.clone()],
            Some("user-7"),
        )
        .unwrap();
    assert_eq!(convoy.total_beads, 2);

    let polecat = f
        .town
        .get_or_create_agent(AgentRole::Polecat, Some(&rig.id))
        .unwrap();
    f.town.hook_bead(&polecat.id, &first.id).unwrap();

    let report = f.town.tick().unwrap();
    assert_eq!(report.dispatched, 1);
    let starts = f.runtime.starts();
    let start = &starts[0];
    assert_eq!(start.agent_id, polecat.id);
    assert_eq!(start.git_url, rig.git_url);
    assert!(start.env_vars.contains_key("TOWN_SESSION_TOKEN"));

    f.runtime.set_status(&polecat.id, completed());
    let report = f.town.tick().unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(report.reviews_merged, 1);
    assert_eq!(
        f.town.get_bead(&first.id).unwrap().unwrap().status,
        BeadStatus::Closed
    );
    let halfway = f.town.get_convoy(&convoy.id).unwrap().unwrap();
    assert_eq!(halfway.closed_beads, 1);
    assert_eq!(halfway.status, ConvoyStatus::Active);

    f.town
        .update_bead_status(&second.id, BeadStatus::Closed, None)
        .unwrap();
    let landed = f.town.get_convoy(&convoy.id).unwrap().unwrap();
    assert_eq!(landed.status, ConvoyStatus::Landed);
    assert!(landed.landed_at.is_some());
}

#[test]
fn failed_merge_leaves_bead_open_for_rework() {
    let mut f = fixture();
    let rig = f.town.add_rig("web", "https://git.example/web.git", "main").unwrap();
    let slung = f.town.sling(&rig.id, "flaky test", None).unwrap();
    f.town.tick().unwrap();

    f.runtime.push_merge(ReviewOutcome::Failed {
        error: "conflict in src/app.rs".into(),
    });
    f.runtime.set_status(&slung.agent.id, completed());
    let report = f.town.tick().unwrap();
    assert_eq!(report.reviews_failed, 1);

    let reviews = f.town.list_reviews(Some(ReviewStatus::Failed)).unwrap();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].error.as_deref(), Some("conflict in src/app.rs"));
    let bead = f.town.get_bead(&slung.bead.id).unwrap().unwrap();
    assert_ne!(bead.status, BeadStatus::Closed);

    let primed = f.town.prime(&slung.agent.id).unwrap();
    assert_eq!(primed.failed_reviews.len(), 1);
}

#[test]
fn gated_review_is_reported_by_the_refinery() {
    let mut f = fixture();
    f.town
        .set_town_config(&TownConfig {
            quality_gates: vec!["cargo test".into()],
            ..TownConfig::default()
        })
        .unwrap();
    let rig = f.town.add_rig("web", "https://git.example/web.git", "main").unwrap();
    let slung = f.town.sling(&rig.id, "tighten auth", None).unwrap();
    f.town.tick().unwrap();

    f.runtime.set_status(&slung.agent.id, completed());
    let report = f.town.tick().unwrap();
    assert_eq!(report.reviews_dispatched, 1);
    assert!(f.runtime.merges().is_empty());

    let entry = f
        .town
        .list_reviews(Some(ReviewStatus::Running))
        .unwrap()
        .pop()
        .unwrap();
    let refinery = f
        .runtime
        .starts()
        .into_iter()
        .find(|s| s.role == AgentRole::Refinery)
        .unwrap();
    assert_eq!(refinery.branch, entry.branch);
    assert!(refinery.system_prompt.contains("cargo test"));

    let done = f
        .town
        .complete_review(&entry.id, ReviewStatus::Merged, Some("abc1234"), None)
        .unwrap();
    assert_eq!(done.status, ReviewStatus::Merged);
    assert_eq!(
        f.town.get_bead(&slung.bead.id).unwrap().unwrap().status,
        BeadStatus::Closed
    );
    let refinery_agent = f.town.get_agent(&refinery.agent_id).unwrap().unwrap();
    assert_eq!(refinery_agent.status, AgentStatus::Idle);
    assert_eq!(refinery_agent.current_hook_bead_id, None);
}

#[test]
fn repeated_start_failures_fail_the_bead() {
    let mut f = fixture();
    f.runtime.fail_starts();
    let rig = f.town.add_rig("web", "https://git.example/web.git", "main").unwrap();
    let slung = f.town.sling(&rig.id, "never starts", None).unwrap();
    let max = f.town.settings().scheduler.max_dispatch_attempts;

    for _ in 0..max {
        let report = f.town.tick().unwrap();
        assert_eq!(report.dispatch_failed, 1);
    }
    let report = f.town.tick().unwrap();
    assert_eq!(report.tripped, 1);
    assert_eq!(f.runtime.starts().len(), max as usize);

    let bead = f.town.get_bead(&slung.bead.id).unwrap().unwrap();
    assert_eq!(bead.status, BeadStatus::Failed);
    let agent = f.town.get_agent(&slung.agent.id).unwrap().unwrap();
    assert_eq!(agent.status, AgentStatus::Idle);
    assert_eq!(agent.current_hook_bead_id, None);
}

#[test]
fn unacknowledged_escalation_climbs_and_reaches_the_mayor() {
    let mut f = fixture();
    let rig = f.town.add_rig("web", "https://git.example/web.git", "main").unwrap();
    let escalation = f
        .town
        .route_escalation(&NewEscalation {
            source_rig_id: rig.id.clone(),
            source_agent_id: None,
            severity: Severity::Low,
            category: "ci".into(),
            message: "pipeline red for an hour".into(),
        })
        .unwrap();
    assert!(f.runtime.starts().is_empty());

    let base = f.town.settings().scheduler.escalation_base();
    f.clock.advance(base + Duration::seconds(1));
    let report = f.town.tick().unwrap();
    assert_eq!(report.escalations_bumped, 1);
    f.town.drain_background();

    let open = f
        .town
        .list_escalations(EscalationFilter {
            acknowledged: Some(false),
            min_severity: None,
        })
        .unwrap();
    assert_eq!(open[0].severity, Severity::Medium);
    let mayor = f
        .runtime
        .starts()
        .into_iter()
        .find(|s| s.role == AgentRole::Mayor)
        .unwrap();
    assert!(mayor.prompt.contains("pipeline red for an hour"));

    f.town.acknowledge_escalation(&escalation.id).unwrap();
    f.clock.advance(base * 10);
    let report = f.town.tick().unwrap();
    assert_eq!(report.escalations_bumped, 0);
}

#[test]
fn mail_reaches_its_recipient_once() {
    let mut f = fixture();
    let rig = f.town.add_rig("web", "https://git.example/web.git", "main").unwrap();
    let slung = f.town.sling(&rig.id, "pair on parser", None).unwrap();
    f.town
        .send_mail("mayor@town-sce", &slung.agent.identity, "heads up", "parser is tricky")
        .unwrap();

    let inbox = f.town.check_mail(&slung.agent.id).unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].subject, "heads up");
    assert!(f.town.check_mail(&slung.agent.id).unwrap().is_empty());

    assert!(matches!(
        f.town.send_mail("mayor@town-sce", "nobody@nowhere", "hi", "x"),
        Err(TownError::NotFound { .. })
    ));
}

#[test]
fn host_serializes_calls_onto_the_town_thread() {
    let f = fixture();
    let runtime = f.runtime.clone();
    let town_id = f.town.id().to_string();
    let mut host = TownHost::new();
    host.spawn(f.town).unwrap();

    let rig = host
        .call(&town_id, |town| {
            town.add_rig("web", "https://git.example/web.git", "main")
        })
        .unwrap()
        .unwrap();
    let rig_id = rig.id.clone();
    host.call(&town_id, move |town| town.sling(&rig_id, "hosted work", None))
        .unwrap()
        .unwrap();
    host.call(&town_id, |town| town.tick()).unwrap().unwrap();

    assert_eq!(runtime.starts().len(), 1);
    let open = host
        .call(&town_id, |town| {
            town.list_beads(&BeadFilter {
                status: Some(BeadStatus::InProgress),
                ..BeadFilter::default()
            })
        })
        .unwrap()
        .unwrap();
    assert_eq!(open.len(), 1);

    assert!(matches!(
        host.call("missing", |town| town.id().to_string()),
        Err(TownError::NotFound { .. })
    ));
    host.shutdown_all();
}
