//! Blocking calls handed to the offload pool

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::{Duration, Instant};

use parley::test_support::{run_actors, run_actors_with};
use parley::{RuntimeConfig, RuntimeError};

const REPORT: &str = r#"
  .report tag outcome -> match outcome {
    ("ok", v) -> print(tag, "ok", v)
    ("err", m) -> print(tag, "err", m)
  }
"#;

/// Serve one HTTP response on a fresh local port
fn serve_once(status: &'static str, body: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });
    port
}

#[test]
fn sleep_delivers_result_message() {
    let src = format!(
        "server Main {{\n  .init -> sleep(20, \"report\", \"nap\")\n{REPORT}}}"
    );
    let run = run_actors(&src, vec![]);
    assert!(run.failures.is_empty(), "{:?}", run.failures);
    assert_eq!(run.output, vec!["nap ok 20"]);
}

#[test]
fn handler_returns_before_offload_finishes() {
    let src = format!(
        "server Main {{\n  .init -> {{\n    sleep(30, \".report\", \"nap\")\n    print(\"issued\")\n  }}\n{REPORT}}}"
    );
    let run = run_actors(&src, vec![]);
    assert_eq!(run.output, vec!["issued", "nap ok 30"]);
}

#[test]
fn timeout_delivers_error() {
    let src = format!(
        "server Main {{\n  .init -> sleep(2000, \"report\", \"slow\")\n{REPORT}}}"
    );
    let config = RuntimeConfig::default()
        .with_workers(2)
        .with_offload_timeout(Duration::from_millis(50));

    let started = Instant::now();
    let run = run_actors_with(config, &src, vec![]);
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert_eq!(run.output.len(), 1);
    assert!(run.output[0].starts_with("slow err"), "{:?}", run.output);
    assert!(run.output[0].contains("timed out"));
}

#[test]
fn wget_fetches_body() {
    let port = serve_once("200 OK", "hello");
    let src = format!(
        "server Main {{\n  .init -> wget(\"http://127.0.0.1:{port}/\", \"report\", \"get\")\n{REPORT}}}"
    );
    let run = run_actors(&src, vec![]);
    assert!(run.failures.is_empty(), "{:?}", run.failures);
    assert_eq!(run.output, vec!["get ok hello"]);
}

#[test]
fn wget_non_success_status_is_an_error() {
    let port = serve_once("404 Not Found", "nope");
    let src = format!(
        "server Main {{\n  .init -> wget(\"http://127.0.0.1:{port}/\", \"report\", \"get\")\n{REPORT}}}"
    );
    let run = run_actors(&src, vec![]);
    assert_eq!(run.output.len(), 1);
    assert!(run.output[0].starts_with("get err"), "{:?}", run.output);
    assert!(run.output[0].contains("404"));
}

#[test]
fn wget_connection_refused_is_an_error() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let src = format!(
        "server Main {{\n  .init -> wget(\"http://127.0.0.1:{port}/\", \"report\", \"down\")\n{REPORT}}}"
    );
    let run = run_actors(&src, vec![]);
    assert_eq!(run.output.len(), 1);
    assert!(run.output[0].starts_with("down err"), "{:?}", run.output);
}

#[test]
fn file_create_with_and_without_reply() {
    let dir = std::env::temp_dir();
    let sync_path = dir.join(format!("parley-sync-{}.txt", std::process::id()));
    let async_path = dir.join(format!("parley-async-{}.txt", std::process::id()));

    let src = format!(
        "server Main {{\n  .init -> {{\n    os.filesystem.create({sync:?}, \"one\")\n    os.filesystem.create({async_:?}, \"two\", \"report\", \"file\")\n  }}\n{REPORT}}}",
        sync = sync_path.display().to_string(),
        async_ = async_path.display().to_string(),
    );
    let run = run_actors(&src, vec![]);
    assert!(run.failures.is_empty(), "{:?}", run.failures);
    assert_eq!(run.output, vec!["file ok ()"]);
    assert_eq!(std::fs::read_to_string(&sync_path).unwrap(), "one");
    assert_eq!(std::fs::read_to_string(&async_path).unwrap(), "two");

    let _ = std::fs::remove_file(sync_path);
    let _ = std::fs::remove_file(async_path);
}

#[test]
fn many_concurrent_sleeps_do_not_block_turns() {
    let src = r#"
server Napper {
  .go ms -> sleep(ms, "done")
  .done outcome -> print("woke")
}
server Main {
  .init -> {
    let i = 0
    loop {
      if i == 8 then return ()
      let n = spawn Napper
      n (.go 100)
      i = i + 1
    }
  }
}
"#;
    let config = RuntimeConfig::default()
        .with_workers(1)
        .with_offload_workers(8);
    let started = Instant::now();
    let run = run_actors_with(config, src, vec![]);
    assert_eq!(run.output.len(), 8);
    // Sequential sleeps would take 800ms
    assert!(started.elapsed() < Duration::from_millis(700));
}

#[test]
fn file_create_without_reply_reports_failures() {
    let path = std::env::temp_dir()
        .join(format!("parley-missing-{}", std::process::id()))
        .join("nested")
        .join("out.txt");
    let src = format!(
        "server Main {{\n  .init -> os.filesystem.create({:?}, \"x\")\n  .failure sel msg -> print(\"failed\", sel)\n}}",
        path.display().to_string()
    );
    let run = run_actors(&src, vec![]);
    assert_eq!(run.output, vec!["failed os.filesystem.create"]);
    assert_eq!(run.failures.len(), 1);
    assert_eq!(run.failures[0].selector, "os.filesystem.create");
    assert!(matches!(run.failures[0].error, RuntimeError::Offload(_)));
}
