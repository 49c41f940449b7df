use std::time::Duration;

use botctl::{prelude::*, sandbox::Sandbox, sandbox::RlimitBackend};

mod common;
use common::{config, engine, init_test_logger, sh};

fn allowlist_policy() -> SandboxPolicy {
    SandboxPolicyBuilder::new()
        .with_syscall_allowlist(["read", "write", "exit_group"])
        .build()
        .unwrap()
}

#[test]
fn unenforceable_policy_refuses_to_launch() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let mut bot = engine.launch(sh("strict", "echo ready; sleep 5"), &allowlist_policy());

    assert_eq!(bot.status(), BotStatus::Disqualified);
    assert!(bot.spawn_failure().unwrap().contains("syscalls"));
    assert!(bot.pid().is_none());
    bot.shutdown();
    assert_eq!(bot.status(), BotStatus::Terminated);
}

#[test]
fn uncontained_execution_can_be_allowed() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(config(dir.path()).with_allow_uncontained(true)).unwrap();
    let mut bot = engine.launch(sh("lenient", "echo ready; sleep 5"), &allowlist_policy());

    assert_eq!(bot.status(), BotStatus::Active);
    bot.shutdown();
}

#[test]
fn open_file_limit_reaches_the_bot() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let policy = SandboxPolicyBuilder::new()
        .with_max_open_files(32)
        .build()
        .unwrap();
    let mut bot = engine.launch(sh("nofile", "echo ready; ulimit -n; sleep 5"), &policy);
    assert_eq!(bot.status(), BotStatus::Active);

    let limit: u64 = String::from_utf8(bot.next_move().unwrap().payload().unwrap().to_vec())
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(limit <= 32);
    bot.shutdown();
}

#[test]
fn cpu_time_limit_stops_a_spinning_bot() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let policy = SandboxPolicyBuilder::new()
        .with_cpu_time(Duration::from_secs(1))
        .build()
        .unwrap();
    let mut bot = engine.launch(
        sh("spin", "echo ready; while :; do :; done").with_move_timeout(Duration::from_secs(10)),
        &policy,
    );
    assert_eq!(bot.status(), BotStatus::Active);

    // killed by SIGXCPU/SIGKILL, its output closes
    assert_eq!(bot.next_move().unwrap(), TurnOutcome::Disconnected);
    assert_eq!(bot.status(), BotStatus::Terminated);
}

#[test]
fn working_directory_is_applied() {
    let dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let policy = SandboxPolicyBuilder::new()
        .with_working_dir(work.path())
        .with_clear_env(true)
        .build()
        .unwrap();
    let mut bot = engine.launch(sh("cwd", "echo ready; pwd -P; read -r line"), &policy);

    let cwd = bot.next_move().unwrap();
    let expected = work.path().canonicalize().unwrap();
    assert_eq!(
        cwd.payload().unwrap(),
        expected.to_str().unwrap().as_bytes()
    );
    bot.shutdown();
}

#[test]
fn replaced_sandbox_is_used() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path()).with_sandbox(Sandbox::new(false).with_backend(RlimitBackend));
    assert_eq!(engine.sandbox().backends(), vec!["rlimit"]);

    let policy = SandboxPolicyBuilder::new()
        .with_max_memory(512)
        .build()
        .unwrap();
    let mut bot = engine.launch(sh("mem", "echo ready; sleep 5"), &policy);
    assert_eq!(bot.status(), BotStatus::Active);
    bot.shutdown();
}
