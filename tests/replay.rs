use serde_json::json;

use shopfloor::config::Config;
use shopfloor::replay::{Replay, Script, Step};

const SCRIPT: &str = r#"
seed:
  line:
    - { id: L1, factoryId: F1, name: Line 1, code: L1 }
  team:
    - { id: T1, lineId: L1, name: T-01, code: T01 }
filters:
  kind: team
steps:
  - children: { parent: line, id: L1, child: team }
  - create: { kind: team, payload: { lineId: L1, name: T-09, code: T09 } }
  - fail_next: { kind: team, op: update }
  - update: { kind: team, id: T1, patch: { name: T-01 Night } }
  - filter: { field: search, value: t-09 }
  - settle
  - delete: { kind: line, id: L1 }
  - gc
"#;

#[tokio::test(start_paused = true)]
async fn test_script_reports_each_step() {
  let script: Script = serde_yaml::from_str(SCRIPT).unwrap();
  assert!(matches!(script.steps[5], Step::Settle));

  let config = Config::default();
  let mut replay = Replay::new(&config);
  let reports = replay.run(&script, &config).await.unwrap();
  assert_eq!(reports.len(), 8);

  assert_eq!(reports[0].step, "children");
  assert_eq!(reports[0].outcome["source"], "Network");
  assert_eq!(reports[0].outcome["data"]["total"], 1);

  assert_eq!(reports[1].outcome["status"], "Committed");
  assert_eq!(reports[1].outcome["id"], "team-1");
  assert_eq!(reports[1].events, vec!["committed create team team-1"]);

  let rejected = reports[3].outcome["error"].as_str().unwrap();
  assert!(rejected.contains("rolled back"), "{rejected}");
  assert!(reports[3].events[0].starts_with("rolled back update team"));

  assert_eq!(reports[4].outcome, json!({ "committed": false, "phase": "Debouncing" }));
  assert_eq!(reports[5].outcome["committed"], true);
  assert_eq!(reports[5].outcome["list"]["data"]["total"], 1);
  assert_eq!(reports[5].outcome["list"]["data"]["data"][0]["id"], "team-1");

  let purged = reports[6].outcome["purged"].as_array().unwrap();
  assert!(purged.iter().any(|t| t == "[line,L1,teams]"), "{purged:?}");
  assert_eq!(replay.remote(shopfloor::models::EntityKind::Line).unwrap().len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_filter_steps_need_a_view() {
  let script: Script = serde_yaml::from_str("steps:\n  - filter: { field: search, value: abc }\n").unwrap();
  let config = Config::default();
  let err = Replay::new(&config).run(&script, &config).await.unwrap_err();
  assert!(err.to_string().contains("no `filters` view"));
}
