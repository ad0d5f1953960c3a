use chrono::Utc;
use taskmill::model::routing::{
    Condition, RouteDecision, RoutingConfig, RoutingRule, RuleTarget, SelectionStrategy,
};
use taskmill::model::work::WorkItem;
use taskmill::model::worker::{ExecutionMode, Worker, WorkerId, WorkerStatus};
use taskmill::routing::evaluate_rules;
use uuid::Uuid;

fn worker(name: &str, capabilities: &[&str], capacity: Option<i32>, active: i32) -> Worker {
    let now = Utc::now();
    Worker {
        id: WorkerId::new(),
        name: name.to_string(),
        status: WorkerStatus::Active,
        mode: ExecutionMode::Auto,
        capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
        capacity,
        active_count: active,
        credentials: Some("sealed".to_string()),
        created_at: now,
        updated_at: now,
    }
}

fn rule(name: &str, priority: Option<i32>, conditions: Vec<Condition>, target: RuleTarget) -> RoutingRule {
    RoutingRule {
        id: Uuid::new_v4(),
        name: name.to_string(),
        priority,
        enabled: true,
        conditions,
        target,
        fallback_worker_id: None,
    }
}

fn config(rules: Vec<RoutingRule>) -> RoutingConfig {
    RoutingConfig {
        scope_id: Uuid::new_v4(),
        rules,
        default_worker_id: None,
    }
}

fn item_with_tags(tags: &[&str]) -> WorkItem {
    let mut item = WorkItem::new("tagged");
    item.tags = tags.iter().map(|s| s.to_string()).collect();
    item
}

fn assigned_to(decision: &RouteDecision) -> WorkerId {
    match decision {
        RouteDecision::Assigned { worker_id, .. } => *worker_id,
        RouteDecision::NoMatch { reason } => panic!("expected assignment, got no match: {reason}"),
    }
}

#[test]
fn evaluation_is_deterministic() {
    let w = worker("alpha", &["review"], Some(3), 0);
    let cfg = config(vec![rule(
        "reviews",
        Some(1),
        vec![Condition::TagsAny {
            tags: vec!["review".into()],
        }],
        RuleTarget::Worker { worker_id: w.id },
    )]);
    let item = item_with_tags(&["review"]);

    let first = evaluate_rules(&cfg, std::slice::from_ref(&w), &item);
    for _ in 0..10 {
        let again = evaluate_rules(&cfg, std::slice::from_ref(&w), &item);
        assert_eq!(assigned_to(&first), assigned_to(&again));
    }
}

#[test]
fn lower_priority_value_wins() {
    let a = worker("alpha", &[], None, 0);
    let b = worker("beta", &[], None, 0);
    let cfg = config(vec![
        rule("late", Some(10), vec![], RuleTarget::Worker { worker_id: a.id }),
        rule("early", Some(1), vec![], RuleTarget::Worker { worker_id: b.id }),
    ]);

    let decision = evaluate_rules(&cfg, &[a, b.clone()], &WorkItem::new("x"));
    assert_eq!(assigned_to(&decision), b.id);
}

#[test]
fn equal_priority_breaks_ties_by_insertion_order() {
    let a = worker("alpha", &[], None, 0);
    let b = worker("beta", &[], None, 0);
    let cfg = config(vec![
        rule("first", Some(5), vec![], RuleTarget::Worker { worker_id: a.id }),
        rule("second", Some(5), vec![], RuleTarget::Worker { worker_id: b.id }),
    ]);

    let decision = evaluate_rules(&cfg, &[a.clone(), b], &WorkItem::new("x"));
    assert_eq!(assigned_to(&decision), a.id);
}

#[test]
fn missing_priority_sorts_last() {
    let a = worker("alpha", &[], None, 0);
    let b = worker("beta", &[], None, 0);
    let cfg = config(vec![
        rule("unranked", None, vec![], RuleTarget::Worker { worker_id: a.id }),
        rule("ranked", Some(100), vec![], RuleTarget::Worker { worker_id: b.id }),
    ]);

    let decision = evaluate_rules(&cfg, &[a, b.clone()], &WorkItem::new("x"));
    assert_eq!(assigned_to(&decision), b.id);
}

#[test]
fn disabled_rules_are_skipped() {
    let a = worker("alpha", &[], None, 0);
    let b = worker("beta", &[], None, 0);
    let mut off = rule("off", Some(1), vec![], RuleTarget::Worker { worker_id: a.id });
    off.enabled = false;
    let cfg = config(vec![
        off,
        rule("on", Some(2), vec![], RuleTarget::Worker { worker_id: b.id }),
    ]);

    let decision = evaluate_rules(&cfg, &[a, b.clone()], &WorkItem::new("x"));
    assert_eq!(assigned_to(&decision), b.id);
}

#[test]
fn empty_conditions_catch_all() {
    let w = worker("alpha", &[], None, 0);
    let cfg = config(vec![rule(
        "catch-all",
        Some(1),
        vec![],
        RuleTarget::Worker { worker_id: w.id },
    )]);

    let decision = evaluate_rules(&cfg, &[w.clone()], &WorkItem::new("anything"));
    assert_eq!(assigned_to(&decision), w.id);
}

#[test]
fn all_conditions_must_match() {
    let w = worker("alpha", &[], None, 0);
    let cfg = config(vec![rule(
        "strict",
        Some(1),
        vec![
            Condition::TagsAny {
                tags: vec!["review".into()],
            },
            Condition::PriorityLte { value: 1 },
        ],
        RuleTarget::Worker { worker_id: w.id },
    )]);

    let mut item = item_with_tags(&["review"]);
    item.priority = 5;
    let decision = evaluate_rules(&cfg, &[w], &item);
    assert!(!decision.matched());
}

#[test]
fn fallback_worker_used_when_primary_at_capacity() {
    let primary = worker("primary", &[], Some(1), 1);
    let fallback = worker("backup", &[], Some(3), 0);
    let mut r = rule(
        "with-fallback",
        Some(1),
        vec![],
        RuleTarget::Worker {
            worker_id: primary.id,
        },
    );
    r.fallback_worker_id = Some(fallback.id);
    let cfg = config(vec![r]);

    let decision = evaluate_rules(&cfg, &[primary, fallback.clone()], &WorkItem::new("x"));
    assert_eq!(assigned_to(&decision), fallback.id);
    assert!(decision.reason().contains("fallback"));
}

#[test]
fn matched_but_unassignable_rule_lets_later_rules_run() {
    let busy = worker("busy", &[], Some(1), 1);
    let idle = worker("idle", &[], None, 0);
    let cfg = config(vec![
        rule("first", Some(1), vec![], RuleTarget::Worker { worker_id: busy.id }),
        rule("second", Some(2), vec![], RuleTarget::Worker { worker_id: idle.id }),
    ]);

    let decision = evaluate_rules(&cfg, &[busy, idle.clone()], &WorkItem::new("x"));
    assert_eq!(assigned_to(&decision), idle.id);
}

#[test]
fn default_worker_is_consulted_last() {
    let d = worker("default", &[], None, 0);
    let mut cfg = config(vec![]);
    cfg.default_worker_id = Some(d.id);

    let decision = evaluate_rules(&cfg, &[d.clone()], &WorkItem::new("x"));
    assert_eq!(assigned_to(&decision), d.id);
    assert!(decision.reason().contains("default"));
}

#[test]
fn no_match_when_nothing_applies() {
    let cfg = config(vec![]);
    let decision = evaluate_rules(&cfg, &[], &WorkItem::new("orphan"));
    assert!(!decision.matched());
}

#[test]
fn preferred_worker_bypasses_rules() {
    let preferred = worker("preferred", &[], None, 0);
    let ruled = worker("ruled", &[], None, 0);
    let cfg = config(vec![rule(
        "everything",
        Some(1),
        vec![],
        RuleTarget::Worker { worker_id: ruled.id },
    )]);

    let mut item = WorkItem::new("picky");
    item.preferred_worker_id = Some(preferred.id);

    let decision = evaluate_rules(&cfg, &[preferred.clone(), ruled], &item);
    assert_eq!(assigned_to(&decision), preferred.id);
}

#[test]
fn unavailable_preferred_worker_falls_through_to_rules() {
    let mut preferred = worker("preferred", &[], Some(1), 1);
    preferred.status = WorkerStatus::Paused;
    let ruled = worker("ruled", &[], None, 0);
    let cfg = config(vec![rule(
        "everything",
        Some(1),
        vec![],
        RuleTarget::Worker { worker_id: ruled.id },
    )]);

    let mut item = WorkItem::new("picky");
    item.preferred_worker_id = Some(preferred.id);

    let decision = evaluate_rules(&cfg, &[preferred, ruled.clone()], &item);
    assert_eq!(assigned_to(&decision), ruled.id);
}

#[test]
fn capability_target_only_considers_covering_workers() {
    let reviewer = worker("reviewer", &["review"], None, 0);
    let builder = worker("builder", &["build"], None, 0);
    let cfg = config(vec![rule(
        "reviews",
        Some(1),
        vec![],
        RuleTarget::Capability {
            capability: "review".into(),
            strategy: SelectionStrategy::LeastBusy,
        },
    )]);

    let decision = evaluate_rules(&cfg, &[builder, reviewer.clone()], &WorkItem::new("x"));
    assert_eq!(assigned_to(&decision), reviewer.id);
}

#[test]
fn least_busy_picks_lowest_active_count() {
    let busy = worker("busy", &["review"], Some(10), 7);
    let idle = worker("idle", &["review"], Some(10), 1);
    let cfg = config(vec![rule(
        "reviews",
        Some(1),
        vec![],
        RuleTarget::Capability {
            capability: "review".into(),
            strategy: SelectionStrategy::LeastBusy,
        },
    )]);

    let decision = evaluate_rules(&cfg, &[busy, idle.clone()], &WorkItem::new("x"));
    assert_eq!(assigned_to(&decision), idle.id);
}

#[test]
fn least_busy_ties_break_by_worker_id() {
    let mut a = worker("a", &["review"], Some(10), 2);
    let mut b = worker("b", &["review"], Some(10), 2);
    // Force a known id ordering.
    a.id = WorkerId(Uuid::from_u128(1));
    b.id = WorkerId(Uuid::from_u128(2));
    let cfg = config(vec![rule(
        "reviews",
        Some(1),
        vec![],
        RuleTarget::Capability {
            capability: "review".into(),
            strategy: SelectionStrategy::LeastBusy,
        },
    )]);

    // Worker order in the input slice must not matter.
    let d1 = evaluate_rules(&cfg, &[a.clone(), b.clone()], &WorkItem::new("x"));
    let d2 = evaluate_rules(&cfg, &[b, a.clone()], &WorkItem::new("x"));
    assert_eq!(assigned_to(&d1), a.id);
    assert_eq!(assigned_to(&d2), a.id);
}

#[test]
fn first_available_picks_lowest_id() {
    let mut a = worker("a", &["review"], Some(10), 9);
    let mut b = worker("b", &["review"], Some(10), 0);
    a.id = WorkerId(Uuid::from_u128(1));
    b.id = WorkerId(Uuid::from_u128(2));
    let cfg = config(vec![rule(
        "reviews",
        Some(1),
        vec![],
        RuleTarget::Capability {
            capability: "review".into(),
            strategy: SelectionStrategy::FirstAvailable,
        },
    )]);

    let decision = evaluate_rules(&cfg, &[b, a.clone()], &WorkItem::new("x"));
    assert_eq!(assigned_to(&decision), a.id);
}

#[test]
fn random_strategy_picks_a_covering_worker() {
    let a = worker("a", &["review"], None, 0);
    let b = worker("b", &["review"], None, 0);
    let cfg = config(vec![rule(
        "reviews",
        Some(1),
        vec![],
        RuleTarget::Capability {
            capability: "review".into(),
            strategy: SelectionStrategy::Random,
        },
    )]);

    for _ in 0..20 {
        let picked = assigned_to(&evaluate_rules(
            &cfg,
            &[a.clone(), b.clone()],
            &WorkItem::new("x"),
        ));
        assert!(picked == a.id || picked == b.id);
    }
}

#[test]
fn workers_at_capacity_are_not_selected() {
    let full = worker("full", &["review"], Some(2), 2);
    let cfg = config(vec![rule(
        "reviews",
        Some(1),
        vec![],
        RuleTarget::Capability {
            capability: "review".into(),
            strategy: SelectionStrategy::LeastBusy,
        },
    )]);

    let decision = evaluate_rules(&cfg, &[full], &WorkItem::new("x"));
    assert!(!decision.matched());
}

#[test]
fn context_condition_matches_exactly() {
    let w = worker("alpha", &[], None, 0);
    let cfg = config(vec![rule(
        "env-prod",
        Some(1),
        vec![Condition::ContextEq {
            key: "env".into(),
            value: serde_json::json!("prod"),
        }],
        RuleTarget::Worker { worker_id: w.id },
    )]);

    let mut item = WorkItem::new("deploy");
    item.context = serde_json::json!({"env": "prod"});
    assert!(evaluate_rules(&cfg, std::slice::from_ref(&w), &item).matched());

    item.context = serde_json::json!({"env": "staging"});
    assert!(!evaluate_rules(&cfg, &[w], &item).matched());
}

#[test]
fn rule_configs_round_trip_through_json() {
    let cfg = config(vec![rule(
        "reviews",
        Some(1),
        vec![
            Condition::TagsAll {
                tags: vec!["review".into(), "urgent".into()],
            },
            Condition::PriorityGte { value: 0 },
        ],
        RuleTarget::Capability {
            capability: "review".into(),
            strategy: SelectionStrategy::RoundRobin,
        },
    )]);

    let json = serde_json::to_value(&cfg.rules).unwrap();
    let parsed: Vec<RoutingRule> = serde_json::from_value(json).unwrap();
    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed[0].name, "reviews");
    assert_eq!(parsed[0].conditions.len(), 2);
}

#[test]
fn unknown_fields_default_sensibly() {
    // Minimal rule JSON, as an operator would write it.
    let json = serde_json::json!([{
        "id": Uuid::new_v4(),
        "name": "bare",
        "priority": null,
        "target": {"kind": "capability", "capability": "review"},
        "fallback_worker_id": null
    }]);
    let rules: Vec<RoutingRule> = serde_json::from_value(json).unwrap();
    assert!(rules[0].enabled);
    assert!(rules[0].conditions.is_empty());
    match &rules[0].target {
        RuleTarget::Capability { strategy, .. } => {
            assert_eq!(*strategy, SelectionStrategy::LeastBusy)
        }
        other => panic!("unexpected target: {other:?}"),
    }
}
