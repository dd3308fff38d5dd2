//! Server instances, mailboxes and the failure path

use std::sync::Arc;
use std::time::Duration;

use parley::parser::parse_program;
use parley::test_support::run_actors;
use parley::{InstanceState, RuntimeConfig, RuntimeError, Runtime, Value};

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn mailbox_is_fifo() {
    let src = "
server Log {
  .note x -> print(x)
}
server Main {
  .init -> {
    let log = spawn Log
    log (.note 1)
    log (.note 2)
    log (.note 3)
    log (.note 4)
    log (.note 5)
  }
}
";
    let run = run_actors(src, vec![]);
    assert!(run.failures.is_empty(), "{:?}", run.failures);
    assert_eq!(run.output, vec!["1", "2", "3", "4", "5"]);
}

#[test]
fn self_send_runs_in_a_later_turn() {
    let src = r#"
server Main {
  .init -> {
    self (.later)
    print("init done")
  }
  .later -> print("later")
}
"#;
    let run = run_actors(src, vec![]);
    assert_eq!(run.output, vec!["init done", "later"]);
}

#[test]
fn init_runs_before_other_messages() {
    let src = r#"
server Box {
  .init -> self.items = []
  .put x -> self.items = add(self.items, x)
  .dump -> print(self.items)
}
server Main {
  .init -> {
    let b = spawn Box
    b (.put 1)
    b (.put 2)
    b (.dump)
  }
}
"#;
    let run = run_actors(src, vec![]);
    assert!(run.failures.is_empty(), "{:?}", run.failures);
    assert_eq!(run.output, vec!["[1, 2]"]);
}

// ============================================================================
// Addressing
// ============================================================================

#[test]
fn main_receives_startup_arguments() {
    let src = "
server Main {
  .init args -> print(len(args), head(args))
}
";
    let run = run_actors(src, vec![Value::string("alpha"), Value::string("beta")]);
    assert_eq!(run.output, vec!["2 alpha"]);
}

#[test]
fn replies_go_to_sender() {
    let src = r#"
server Doubler {
  .double n -> sender (.result n * 2)
}
server Main {
  .init -> {
    let d = spawn Doubler
    d (.double 21)
  }
  .result n -> print(n)
}
"#;
    let run = run_actors(src, vec![]);
    assert_eq!(run.output, vec!["42"]);
}

#[test]
fn top_level_statements_can_drive_actors() {
    let src = r#"
server Greeter {
  .hello name -> print("hello " ++ name)
}
let g = spawn Greeter
g (.hello "world")
"#;
    let run = run_actors(src, vec![]);
    assert_eq!(run.output, vec!["hello world"]);
}

// ============================================================================
// Fan-out / fan-in
// ============================================================================

const FAN_OUT: &str = r#"
let sum = xs -> {
  let total = 0
  let rest = xs
  loop {
    if len(rest) == 0 then return total
    total = total + head(rest)
    rest = tail(rest)
  }
}

server Worker {
  .job id n -> sender (.collect id, n * n)
}

server Aggregator {
  .init -> self.jobs = hashmap.new()
  .run n -> {
    let id = genToken()
    self.jobs = put(self.jobs, id, (sender, n, []))
    let i = 0
    loop {
      if i == n then return ()
      let w = spawn Worker
      w (.job id, i)
      i = i + 1
    }
  }
  .collect id r -> {
    let (requester, expected, results) = get(self.jobs, id)
    let results = add(results, r)
    if len(results) == expected then {
      self.jobs = remove(self.jobs, id)
      requester (.done len(results), sum(results))
    } else {
      self.jobs = put(self.jobs, id, (requester, expected, results))
    }
  }
}

server Main {
  .init -> {
    let agg = spawn Aggregator
    agg (.run 5)
    agg (.run 3)
  }
  .done count total -> print(count, total)
}
"#;

#[test]
fn fan_out_fan_in_replies_once_per_job() {
    let run = run_actors(FAN_OUT, vec![]);
    assert!(run.failures.is_empty(), "{:?}", run.failures);

    let mut output = run.output;
    output.sort();
    // 0+1+4+9+16 and 0+1+4
    assert_eq!(output, vec!["3 5", "5 30"]);
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn unknown_selector_fails_without_affecting_others() {
    let src = r#"
server Counter {
  .init -> self.n = 0
  .inc -> self.n = self.n + 1
  .show -> print(self.n)
}
server Main {
  .init -> {
    let a = spawn Counter
    let b = spawn Counter
    a (.bogus)
    a (.inc)
    b (.inc)
    b (.inc)
    a (.show)
  }
}
"#;
    let run = run_actors(src, vec![]);
    assert_eq!(run.output, vec!["1"]);
    assert_eq!(run.failures.len(), 1);
    assert_eq!(run.failures[0].selector, "bogus");
    assert!(matches!(
        &run.failures[0].error,
        RuntimeError::Selector { actor_type, selector }
            if actor_type == "Counter" && selector == "bogus"
    ));
}

#[test]
fn failed_turn_does_not_stop_the_instance() {
    let src = r#"
server Fragile {
  .crash -> throw "boom"
  .ok -> print("still alive")
}
server Main {
  .init -> {
    let f = spawn Fragile
    f (.crash)
    f (.ok)
  }
}
"#;
    let run = run_actors(src, vec![]);
    assert_eq!(run.output, vec!["still alive"]);
    assert!(matches!(run.failures[0].error, RuntimeError::User(_)));
}

#[test]
fn failure_handler_is_notified() {
    let src = r#"
server Main {
  .init -> self (.divide 0)
  .divide n -> 10 / n
  .failure selector message -> print("failed:", selector)
}
"#;
    let run = run_actors(src, vec![]);
    assert_eq!(run.output, vec!["failed: divide"]);
    assert_eq!(run.failures.len(), 1);
    assert!(matches!(run.failures[0].error, RuntimeError::DivisionByZero));
}

#[test]
fn run_main_reports_failures() {
    let program = parse_program("server Main { .init -> missing_name }").unwrap();
    let runtime = Runtime::new(RuntimeConfig::default().with_workers(2));
    let report = runtime.run_main(&program, vec![]).unwrap();
    assert!(!report.is_clean());
    assert!(matches!(
        report.failures[0].error,
        RuntimeError::Name { .. }
    ));
    assert_eq!(runtime.state_of(&report.main), Some(InstanceState::Idle));
}

#[test]
fn run_main_without_main_server() {
    let program = parse_program("server Other { .x -> 1 }").unwrap();
    let runtime = Runtime::new(RuntimeConfig::default());
    assert!(matches!(
        runtime.run_main(&program, vec![]),
        Err(RuntimeError::UnknownServer(name)) if name == "Main"
    ));
}

#[test]
fn spawning_unknown_server_fails_the_turn() {
    let run = run_actors("server Main { .init -> spawn Ghost }", vec![]);
    assert!(matches!(
        run.failures[0].error,
        RuntimeError::UnknownServer(_)
    ));
}

#[test]
fn many_instances_run_to_quiescence() {
    let src = "
server Echo {
  .ping n -> sender (.pong n)
}
server Main {
  .init -> {
    self.seen = 0
    let i = 0
    loop {
      if i == 200 then return ()
      let e = spawn Echo
      e (.ping i)
      i = i + 1
    }
  }
  .pong n -> {
    self.seen = self.seen + 1
    if self.seen == 200 then print(\"all\")
  }
}
";
    let runtime = Runtime::new(RuntimeConfig::default().with_workers(8));
    let report = runtime
        .run_main(&parse_program(src).unwrap(), vec![])
        .unwrap();
    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(runtime.actor_count(), 201);
    assert_eq!(runtime.field_of(&report.main, "seen"), Some(Value::Int(200)));
    assert!(runtime.wait_idle_timeout(Duration::from_millis(10)));
}

#[test]
fn runaway_recursion_fails_only_its_turn() {
    let src = r#"
server Spiral {
  .go -> {
    let f = n -> f(n + 1)
    f(0)
  }
}
server Steady {
  .ping -> print("steady")
}
server Main {
  .init -> {
    let s = spawn Spiral
    let t = spawn Steady
    s (.go)
    t (.ping)
    s (.go)
    t (.ping)
  }
}
"#;
    let run = run_actors(src, vec![]);
    assert_eq!(run.output, vec!["steady", "steady"]);
    assert_eq!(run.failures.len(), 2);
    assert!(run
        .failures
        .iter()
        .all(|f| f.selector == "go" && matches!(f.error, RuntimeError::CallDepth { .. })));
}

// ============================================================================
// Isolation
// ============================================================================

#[test]
fn handlers_cannot_assign_top_level_bindings() {
    let src = r#"
let counter = 0
server Bump {
  .go -> counter = counter + 1
  .show -> print(counter)
}
server Main {
  .init -> {
    let b = spawn Bump
    b (.go)
    b (.show)
  }
}
"#;
    let run = run_actors(src, vec![]);
    assert_eq!(run.output, vec!["0"]);
    assert_eq!(run.failures.len(), 1);
    assert!(matches!(
        &run.failures[0].error,
        RuntimeError::Type(msg) if msg.contains("read-only")
    ));
}

#[test]
fn closures_cannot_write_another_instances_scope() {
    let src = r#"
server Holder {
  .init -> {
    let n = 0
    self.bump = () -> { n = n + 1; n }
  }
  .lend to -> to (.use self.bump)
  .own -> {
    let f = self.bump
    print("own", f())
  }
}
server Borrower {
  .use f -> f()
}
server Main {
  .init -> {
    let h = spawn Holder
    let b = spawn Borrower
    h (.lend b)
    h (.own)
  }
}
"#;
    let run = run_actors(src, vec![]);
    assert_eq!(run.output, vec!["own 1"]);
    assert_eq!(run.failures.len(), 1);
    assert_eq!(run.failures[0].selector, "use");
    assert!(run.failures[0].error.to_string().contains("read-only"));
}

#[test]
fn local_closures_do_not_pin_message_arguments() {
    let program = parse_program(
        "server Named {\n  .named data -> {\n    let helper = x -> x\n    helper(len(data))\n  }\n}",
    )
    .unwrap();
    let runtime = Runtime::new(RuntimeConfig::default().with_workers(2));
    runtime.load(&program).unwrap();
    let named = runtime.spawn("Named").unwrap();

    let payload = Arc::new(vec![Value::Int(0); 100_000]);
    for _ in 0..5 {
        runtime
            .send(&named, "named", vec![Value::List(Arc::clone(&payload))])
            .unwrap();
    }
    assert!(runtime.wait_idle_timeout(Duration::from_secs(10)));
    assert!(runtime.failures().is_empty());
    assert_eq!(Arc::strong_count(&payload), 1);
}
