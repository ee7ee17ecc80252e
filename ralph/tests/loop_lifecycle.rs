//! End-to-end loop tests with real subprocesses and a real git repository.
//!
//! Agents are `sh` scripts registered as user providers, validation runs
//! through the platform shell, and successful tasks are committed with git.
#![cfg(unix)]

use std::collections::BTreeMap;
use std::time::Duration;

use ralph::engine::{EngineSettings, LoopEngine, RunSummary};
use ralph::error::TaskError;
use ralph::io::agent::AgentInvoker;
use ralph::io::git::Git;
use ralph::io::providers::{PromptDelivery, ProviderDefinition, ProviderRegistry};
use ralph::io::validation::ShellValidator;
use ralph::observer::LoopEvent;
use ralph::test_support::TestRepo;

type RealEngine = LoopEngine<AgentInvoker, ShellValidator, Git>;

/// Provider running `script` through `sh -c`; the context text arrives as `$1`.
fn sh_agent(script: &str) -> ProviderDefinition {
    ProviderDefinition {
        executable: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            script.to_string(),
            "sh".to_string(),
            "{prompt}".to_string(),
        ],
        prompt: PromptDelivery::Argument,
        model_flag: "--model".to_string(),
        default_model: None,
        read_prompt_file: true,
    }
}

fn engine(repo: &TestRepo, agent: ProviderDefinition, settings: EngineSettings) -> RealEngine {
    let mut definitions = BTreeMap::new();
    definitions.insert("sh-agent".to_string(), agent);
    let registry = ProviderRegistry::with_definitions(&definitions).expect("registry");
    let invoker = AgentInvoker::new(registry, None)
        .with_echo(false)
        .with_workdir(repo.path());
    LoopEngine::new(
        repo.store(),
        repo.context_builder(),
        invoker,
        ShellValidator::in_dir(repo.path()),
        Git::new(repo.path()),
        EngineSettings {
            default_provider: Some("sh-agent".to_string()),
            ..settings
        },
    )
}

fn run(engine: &RealEngine, target: Option<&str>) -> (RunSummary, Vec<LoopEvent>) {
    let mut events = Vec::new();
    let summary = engine
        .run_all(target, &mut |event: &LoopEvent| events.push(event.clone()))
        .expect("run");
    (summary, events)
}

fn task(validation_cmd: &str, affected: &str) -> String {
    format!(
        "---\ntask_id: T-7\nvalidation_cmd: {validation_cmd}\naffected_files: {affected}\n---\n# Objective\nCreate the feature file\n"
    )
}

/// Agent writes the file, validation passes on attempt 1, the task lands in
/// `done/` with a single attempt and everything it touched is committed.
#[test]
fn passing_validation_moves_task_to_done_and_commits() {
    let repo = TestRepo::new().expect("repo");
    let raw = task("test -f feature.txt", "feature.txt");
    repo.write_task("0001-feat-feature.md", &raw).expect("task");
    repo.commit_all("chore: add task").expect("commit");

    let engine = engine(
        &repo,
        sh_agent("echo created > feature.txt; echo proposal ready"),
        EngineSettings::default(),
    );
    let (summary, events) = run(&engine, None);

    assert_eq!(summary.done(), 1);
    assert_eq!(summary.tasks[0].attempts, 1);
    assert!(summary.tasks[0].committed);
    assert!(!repo.paths().todo.join("0001-feat-feature.md").exists());

    let done = repo.read("tasks/done/0001-feat-feature.md").expect("done");
    assert!(done.starts_with(&raw));
    assert!(done.contains("- Status: DONE"));
    assert_eq!(done.matches("### Attempt").count(), 1);
    assert!(done.contains("proposal ready"));

    let log = repo.git(&["log", "-1", "--format=%s"]).expect("log");
    assert_eq!(log.trim(), "feat(T-7): Create the feature file");
    let status = repo.git(&["status", "--porcelain"]).expect("status");
    assert!(status.trim().is_empty(), "unexpected changes:\n{status}");
    assert!(matches!(events.last(), Some(LoopEvent::TaskCompleted { attempts: 1, committed: true, .. })));
}

/// Validation never passes: all three attempts are recorded with the
/// validation error and the task lands in `failed/` without a commit.
#[test]
fn failing_validation_exhausts_retries() {
    let repo = TestRepo::new().expect("repo");
    let raw = task("exit 1", "feature.txt");
    repo.write_task("0001-fix-thing.md", &raw).expect("task");
    repo.commit_all("chore: add task").expect("commit");
    let head_before = repo.git(&["rev-parse", "HEAD"]).expect("head");

    let engine = engine(&repo, sh_agent("echo trying"), EngineSettings::default());
    let (summary, events) = run(&engine, None);

    assert_eq!(summary.failed(), 1);
    assert_eq!(summary.tasks[0].attempts, 3);
    let failed = repo.read("tasks/failed/0001-fix-thing.md").expect("failed");
    assert!(failed.starts_with(&raw));
    assert!(failed.contains("- Status: FAILED"));
    for n in 1..=3 {
        assert!(failed.contains(&format!("### Attempt {n} Failed")));
    }
    assert_eq!(failed.matches("failed with exit code 1").count(), 4);
    assert!(!repo.paths().todo.join("0001-fix-thing.md").exists());
    assert_eq!(repo.git(&["rev-parse", "HEAD"]).expect("head"), head_before);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, LoopEvent::ProposalReceived { .. }))
            .count(),
        3
    );
}

/// The second attempt sees the first attempt's failure in its context.
#[test]
fn retry_context_includes_previous_failure() {
    let repo = TestRepo::new().expect("repo");
    repo.write_task("0001-a.md", &task("test -f feature.txt", "feature.txt"))
        .expect("task");
    repo.commit_all("chore: add task").expect("commit");

    // Only create the file once the context mentions a failed attempt.
    let script = r#"case "$1" in *"Attempt 1 Failed"*) echo ok > feature.txt;; esac"#;
    let engine = engine(&repo, sh_agent(script), EngineSettings::default());
    let (summary, _) = run(&engine, None);

    assert_eq!(summary.done(), 1);
    assert_eq!(summary.tasks[0].attempts, 2);
}

/// A prefix target runs exactly that task and leaves the others pending.
#[test]
fn target_prefix_runs_only_the_selected_task() {
    let repo = TestRepo::new().expect("repo");
    for name in ["0001-a.md", "0002-x.md", "0003-b.md"] {
        repo.write_task(name, &task("true", "")).expect("task");
    }
    repo.commit_all("chore: add tasks").expect("commit");

    let engine = engine(&repo, sh_agent("true"), EngineSettings::default());
    let (summary, _) = run(&engine, Some("0002"));

    assert_eq!(summary.tasks.len(), 1);
    assert_eq!(summary.tasks[0].file_name, "0002-x.md");
    assert!(repo.paths().done.join("0002-x.md").exists());
    assert!(repo.paths().todo.join("0001-a.md").exists());
    assert!(repo.paths().todo.join("0003-b.md").exists());
}

#[test]
fn unknown_target_is_not_found_and_touches_nothing() {
    let repo = TestRepo::new().expect("repo");
    let raw = task("true", "");
    repo.write_task("0001-a.md", &raw).expect("task");

    let engine = engine(&repo, sh_agent("true"), EngineSettings::default());
    let err = engine
        .run_all(Some("0042"), &mut |_: &LoopEvent| {})
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<TaskError>(),
        Some(TaskError::NotFound { .. })
    ));
    assert_eq!(repo.read("tasks/todo/0001-a.md").expect("todo"), raw);
    assert!(!repo.paths().done.join("0001-a.md").exists());
    assert!(!repo.paths().failed.join("0001-a.md").exists());
}

/// A hung agent is killed at the timeout and the attempt counts as failed.
#[test]
fn hung_agent_times_out() {
    let repo = TestRepo::new().expect("repo");
    repo.write_task("0001-a.md", &task("true", "")).expect("task");

    let sleeper = ProviderDefinition {
        executable: "sleep".to_string(),
        args: vec!["30".to_string()],
        prompt: PromptDelivery::Stdin,
        model_flag: "--model".to_string(),
        default_model: None,
        read_prompt_file: false,
    };
    let engine = engine(
        &repo,
        sleeper,
        EngineSettings {
            retries: 1,
            agent_timeout: Duration::from_millis(100),
            ..EngineSettings::default()
        },
    );
    let (summary, _) = run(&engine, None);

    assert_eq!(summary.failed(), 1);
    let failed = repo.read("tasks/failed/0001-a.md").expect("failed");
    assert!(failed.contains("timed out after 100ms"));
}
