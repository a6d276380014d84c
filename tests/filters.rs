use std::time::Duration;

use shopfloor::cache::{QueryClient, Tag};
use shopfloor::entity::erase;
use shopfloor::error::CacheError;
use shopfloor::event::CacheEvent;
use shopfloor::filter::{FilterConfig, FilterMachine, GuardLimits, OperationType, Phase};
use shopfloor::models::{EntityKind, Team};
use shopfloor::remote::{MemoryBinding, Op};

fn teams(count: usize) -> Vec<Team> {
  (1..=count)
    .map(|n| Team {
      id: format!("T{n}"),
      line_id: "L1".to_string(),
      name: if n % 2 == 0 { format!("abc {n}") } else { format!("xyz {n}") },
      code: format!("T{n:02}"),
      leader_id: None,
    })
    .collect()
}

#[tokio::test(start_paused = true)]
async fn test_typing_commits_once_and_resets_page() {
  let client = QueryClient::new();
  let remote = MemoryBinding::<Team>::new().into_shared();
  remote.seed(teams(30)).unwrap();
  client.register(erase(remote.clone()));

  let mut filters = FilterMachine::new(FilterConfig::default());
  let page_three = filters.update_pagination(3, 5).unwrap().unwrap();
  assert_eq!(page_three.operation, OperationType::Pagination);
  client.resolve_list(EntityKind::Team, &filters.params()).await.unwrap();
  assert_eq!(remote.calls(Op::List), 1);

  for typed in ["a", "ab", "abc"] {
    assert_eq!(filters.update_filter("search", typed).unwrap(), None);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(filters.tick().unwrap(), None);
  }
  assert_eq!(filters.phase(), Phase::Debouncing);

  let commit = filters.settle().await.unwrap().unwrap();
  assert!(commit.page_reset);
  assert_eq!(commit.pagination.page, 1);
  assert_eq!(commit.pagination.limit, 5);
  assert_eq!(commit.filters["search"], "abc");
  assert_eq!(filters.tick().unwrap(), None);

  let params = filters.params();
  let page = client.resolve_list(EntityKind::Team, &params).await.unwrap();
  assert_eq!(page.data["total"], 15);
  assert_eq!(page.data["page"], 1);
  assert_eq!(remote.calls(Op::List), 2);
  assert!(client.peek(&Tag::list(EntityKind::Team, &params)).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_runaway_commits_are_stopped_and_reported() {
  let client = QueryClient::new();
  let mut events = client.subscribe_events();
  let config = FilterConfig {
    guard: GuardLimits {
      global_ceiling: 4,
      ..GuardLimits::default()
    },
    ..FilterConfig::default()
  };
  let mut filters = FilterMachine::new(config).with_events(client.events().clone());

  for page in 2..=5 {
    assert!(filters.update_pagination(page, 10).unwrap().is_some());
  }
  let err = filters.update_pagination(6, 10).unwrap_err();
  assert_eq!(
    err,
    CacheError::OperationLimitExceeded {
      operation: "pagination".to_string(),
      count: 4,
      ceiling: 4,
    }
  );
  assert_eq!(filters.pagination().page, 5);
  assert!(matches!(
    events.try_next(),
    Some(CacheEvent::OperationLimitExceeded { count: 4, .. })
  ));

  filters.reset_session();
  assert!(filters.update_pagination(6, 10).unwrap().is_some());
}
