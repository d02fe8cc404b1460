use kestrel_harness::scenarios::{self, Scenario, ScenarioConfig};
use kestrel_harness::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome, validate_log_line};

fn small() -> ScenarioConfig {
    ScenarioConfig {
        threads: 3,
        rounds: 40,
    }
}

#[test]
fn mutex_stress_passes() {
    let report = scenarios::run(Scenario::MutexStress, small()).unwrap();
    assert_eq!(report.scenario, "mutex-stress");
    assert_eq!(report.details["total"], 120);
}

#[test]
fn mutex_fifo_reports_arrival_order() {
    let report = scenarios::run(Scenario::MutexFifo, small()).unwrap();
    assert_eq!(report.details["order"], serde_json::json!([0, 1, 2]));
    assert!(report.counters.handoffs >= 3);
}

#[test]
fn condvar_and_join_pass() {
    scenarios::run(Scenario::Condvar, small()).unwrap();
    let report = scenarios::run(Scenario::Join, small()).unwrap();
    assert_eq!(report.details["codes"], serde_json::json!([0, 1, 2]));
}

#[test]
fn rollback_undoes_the_lost_reply() {
    let report = scenarios::run(Scenario::Rollback, small()).unwrap();
    assert_eq!(report.details["value"], 3);
    assert_eq!(report.details["rolled_back"], 1);
    assert!(report.counters.rollbacks_fired >= 1);
}

#[test]
fn sysmsg_reaches_every_client() {
    let report = scenarios::run(Scenario::Sysmsg, small()).unwrap();
    assert_eq!(report.details["broadcasts"], 16);
    assert_eq!(report.details["deliveries"], 48);
}

#[test]
fn scenario_reports_validate_as_log_lines() {
    let report = scenarios::run(Scenario::MutexStress, small()).unwrap();
    let mut emitter = LogEmitter::to_buffer("it");
    emitter
        .emit(
            LogEntry::new("", LogLevel::Info, "scenario_end")
                .with_scenario(report.scenario)
                .with_outcome(Outcome::Pass)
                .with_counters(report.counters)
                .with_details(report.details),
        )
        .unwrap();
    let text = emitter.buffered().unwrap();
    let entry = validate_log_line(text.trim(), 1).unwrap();
    assert_eq!(entry.scenario.as_deref(), Some("mutex-stress"));
}
