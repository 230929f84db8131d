//! Local-execution builds through the full scheduler.

#![cfg(unix)]

mod harness;

use harness::{shell_step, Harness};

use bx_execute::{BuildGraph, Cmd, DepsMode, ExecError, Scheduler, StepDef, StepStatus};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn chain_of_steps_builds_in_order() {
    let h = Harness::new();
    h.write("src/in.txt", "hello");

    let graph = BuildGraph::new(vec![
        shell_step(
            "gen",
            "cat src/in.txt > out/stage1.txt",
            &["src/in.txt"],
            &["out/stage1.txt"],
        ),
        shell_step(
            "use",
            "cat out/stage1.txt out/stage1.txt > out/stage2.txt",
            &["out/stage1.txt"],
            &["out/stage2.txt"],
        ),
    ])
    .unwrap();

    let scheduler = Scheduler::new(h.local_executor(false), graph, false, CancellationToken::new());
    let result = scheduler.run().await.unwrap();

    assert!(result.success);
    assert_eq!(result.done, 2);
    assert_eq!(h.read("out/stage2.txt"), "hellohello");

    // Outputs landed in the overlay with the producing command's hash.
    let fi = h.fs.stat(&h.root, "out/stage1.txt").unwrap();
    match fi.entry {
        bx_hashfs::FileEntry::Regular(r) => assert!(!r.cmd_hash.is_empty()),
        other => panic!("want regular output, got {other:?}"),
    }

    // Both steps are in the ninja log now.
    let log = h.ninja_log.lock().unwrap();
    assert!(log.get("out/stage1.txt").is_some());
    assert!(log.get("out/stage2.txt").is_some());
}

#[tokio::test]
async fn failing_step_blocks_dependents_and_keeps_going() {
    let h = Harness::new();
    h.write("src/a.txt", "a");

    let graph = BuildGraph::new(vec![
        shell_step("bad", "echo broken >&2; exit 1", &[], &["out/bad.txt"]),
        shell_step(
            "dependent",
            "cat out/bad.txt > out/dep.txt",
            &["out/bad.txt"],
            &["out/dep.txt"],
        ),
        shell_step(
            "independent",
            "cat src/a.txt > out/ok.txt",
            &["src/a.txt"],
            &["out/ok.txt"],
        ),
    ])
    .unwrap();

    let scheduler = Scheduler::new(h.local_executor(false), graph, true, CancellationToken::new());
    let result = scheduler.run().await.unwrap();

    assert!(!result.success);
    assert_eq!(result.failed, 1);
    assert_eq!(result.blocked, 1);
    // keep_going let the independent step finish.
    assert_eq!(h.read("out/ok.txt"), "a");
    assert!(!h.exists("out/dep.txt"));

    // stderr of the failing command is preserved verbatim.
    let bad = result.outcomes.iter().find(|o| o.id == "bad").unwrap();
    assert_eq!(bad.status, StepStatus::NonZeroExit);
    assert_eq!(String::from_utf8_lossy(&bad.stderr), "broken\n");
}

#[tokio::test]
async fn missing_source_input_is_fatal() {
    let h = Harness::new();
    let graph = BuildGraph::new(vec![shell_step(
        "cc",
        "true",
        &["src/never_written.cc"],
        &["out/o.o"],
    )])
    .unwrap();

    let scheduler = Scheduler::new(h.local_executor(false), graph, false, CancellationToken::new());
    let err = scheduler.run().await.unwrap_err();
    assert!(matches!(err, ExecError::MissingInput { .. }), "got {err}");
}

#[tokio::test]
async fn phony_steps_propagate_readiness_only() {
    let h = Harness::new();
    h.write("src/a.txt", "a");

    let mut phony = StepDef {
        cmd: Cmd {
            id: "all".to_string(),
            rule: "phony".to_string(),
            inputs: vec!["out/a.txt".to_string()],
            ..Default::default()
        },
        phony: true,
        ..Default::default()
    };
    phony.cmd.outputs = vec!["all".to_string()];

    let graph = BuildGraph::new(vec![
        shell_step("a", "cat src/a.txt > out/a.txt", &["src/a.txt"], &["out/a.txt"]),
        phony,
    ])
    .unwrap();

    let scheduler = Scheduler::new(h.local_executor(false), graph, false, CancellationToken::new());
    let result = scheduler.run().await.unwrap();
    assert!(result.success);
    assert_eq!(result.done, 1);
    assert_eq!(result.skipped, 1);
}

#[tokio::test]
async fn second_build_is_up_to_date() {
    let h = Harness::new();
    h.write("src/in.txt", "v1");

    let steps = || {
        BuildGraph::new(vec![shell_step(
            "gen",
            "cat src/in.txt > out/gen.txt",
            &["src/in.txt"],
            &["out/gen.txt"],
        )])
        .unwrap()
    };

    let executor = h.local_executor(false);
    let result = Scheduler::new(executor.clone(), steps(), false, CancellationToken::new())
        .run()
        .await
        .unwrap();
    assert_eq!(result.done, 1);

    let result = Scheduler::new(executor, steps(), false, CancellationToken::new())
        .run()
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.done, 0);
    assert_eq!(result.skipped, 1);
}

#[tokio::test]
async fn missing_output_fails_unless_ignored() {
    let h = Harness::new();

    let graph = || {
        BuildGraph::new(vec![shell_step(
            "forgetful",
            "true",
            &[],
            &["out/never_created.txt"],
        )])
        .unwrap()
    };

    let result = Scheduler::new(h.local_executor(false), graph(), false, CancellationToken::new())
        .run()
        .await
        .unwrap();
    assert!(!result.success);
    let outcome = &result.outcomes[0];
    assert!(outcome.error.as_deref().unwrap_or("").contains("missing output"));

    // The experiment knob turns it into a warning.
    let result = Scheduler::new(h.local_executor(true), graph(), false, CancellationToken::new())
        .run()
        .await
        .unwrap();
    assert!(result.success);
}

#[tokio::test]
async fn local_timeout_is_classified() {
    let h = Harness::new();
    let mut step = shell_step("slow", "sleep 30", &[], &["out/slow.txt"]);
    step.cmd.exec_timeout = std::time::Duration::from_millis(100);

    let graph = BuildGraph::new(vec![step]).unwrap();
    let scheduler = Scheduler::new(h.local_executor(false), graph, false, CancellationToken::new());
    let result = scheduler.run().await.unwrap();
    assert!(!result.success);
    assert_eq!(result.outcomes[0].status, StepStatus::Timeout);
}

#[tokio::test]
async fn depfile_merges_into_deps_log() {
    let h = Harness::new();
    h.write("src/in.cc", "int main() {}");
    h.write("src/in.h", "#pragma once");

    let mut step = shell_step(
        "cc",
        "cat src/in.cc > out/in.o; printf 'out/in.o: src/in.cc src/in.h\\n' > out/in.o.d",
        &["src/in.cc"],
        &["out/in.o"],
    );
    step.cmd.deps = DepsMode::Gcc;
    step.cmd.depfile = Some("out/in.o.d".to_string());

    let graph = BuildGraph::new(vec![step]).unwrap();
    let scheduler = Scheduler::new(h.local_executor(false), graph, false, CancellationToken::new());
    let result = scheduler.run().await.unwrap();
    assert!(result.success, "{:?}", result.outcomes);

    let deps = h.deps_log.lock().unwrap().get("out/in.o").unwrap();
    assert_eq!(deps.deps, vec!["src/in.cc".to_string(), "src/in.h".to_string()]);
}

#[tokio::test]
async fn restat_restores_mtime_when_content_unchanged() {
    let h = Harness::new();

    // First build creates the output.
    let mut first = shell_step("r1", "printf stable > out/stamp.txt", &[], &["out/stamp.txt"]);
    first.cmd.restat = true;
    let graph = BuildGraph::new(vec![first]).unwrap();
    Scheduler::new(h.local_executor(false), graph, false, CancellationToken::new())
        .run()
        .await
        .unwrap();
    let prior = h.fs.stat(&h.root, "out/stamp.txt").unwrap();
    let prior_mtime = prior.entry.mtime_ns();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    // A different command writes identical content; restat keeps the
    // prior mtime so dependents are not re-triggered.
    let mut second = shell_step(
        "r2",
        "sleep 0; printf stable > out/stamp.txt",
        &[],
        &["out/stamp.txt"],
    );
    second.cmd.restat = true;
    let graph = BuildGraph::new(vec![second]).unwrap();
    let result = Scheduler::new(h.local_executor(false), graph, false, CancellationToken::new())
        .run()
        .await
        .unwrap();
    assert!(result.success);

    let after = h.fs.stat(&h.root, "out/stamp.txt").unwrap();
    assert_eq!(after.entry.mtime_ns(), prior_mtime);
}

#[tokio::test]
async fn pure_local_result_is_published_to_action_cache() {
    let h = Harness::new();
    h.write("src/in.txt", "payload");

    let graph = || {
        let mut step = shell_step(
            "gen",
            "cat src/in.txt > out/pure.txt",
            &["src/in.txt"],
            &["out/pure.txt"],
        );
        step.cmd.pure = true;
        BuildGraph::new(vec![step]).unwrap()
    };

    // The loopback-wired executor; no platform properties on the step,
    // so dispatch stays local while the action cache is live.
    let executor = h.remote_executor();
    let first = Scheduler::new(executor.clone(), graph(), false, CancellationToken::new())
        .run()
        .await
        .unwrap();
    assert_eq!(first.done, 1, "{:?}", first.outcomes);

    // Wipe the output from disk and the overlay; only the published
    // action result can satisfy the second build.
    std::fs::remove_file(format!("{}/out/pure.txt", h.root)).unwrap();
    h.fs.forget(&h.root, "out/pure.txt");

    let second = Scheduler::new(executor, graph(), false, CancellationToken::new())
        .run()
        .await
        .unwrap();
    assert!(second.success);
    assert_eq!(second.cache_hits, 1, "{:?}", second.outcomes);

    // Cache hit implies the output is back in the overlay with the
    // cache key recorded, content served from the store.
    let fi = h.fs.stat(&h.root, "out/pure.txt").unwrap();
    match fi.entry {
        bx_hashfs::FileEntry::Regular(r) => assert!(!r.action_digest.is_zero()),
        other => panic!("want regular entry, got {other:?}"),
    }
    assert_eq!(h.fs.read_file(&h.root, "out/pure.txt").unwrap(), b"payload");
}

#[tokio::test]
async fn cancellation_stops_the_build() {
    let h = Harness::new();
    let cancel = CancellationToken::new();

    let graph = BuildGraph::new(vec![shell_step("slow", "sleep 30", &[], &["out/s.txt"])]).unwrap();
    let scheduler = Scheduler::new(h.local_executor(false), graph, false, cancel.clone());

    let cancel2 = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancel2.cancel();
    });

    let result = scheduler.run().await.unwrap();
    assert!(!result.success);
    assert_eq!(result.canceled, 1);
}
