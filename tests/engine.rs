use std::time::{Duration, Instant};

use botctl::prelude::*;

mod common;
use common::{echo_bot, engine, sh};

#[test]
fn launch_all_keeps_the_order() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let ids = ["north", "east", "south", "west"];
    let mut bots = engine.launch_all(
        ids.iter().map(|id| echo_bot(id)).collect(),
        &SandboxPolicy::unrestricted(),
    );

    assert_eq!(bots.iter().map(BotSupervisor::id).collect::<Vec<_>>(), ids);
    assert!(bots.iter().all(|bot| bot.status() == BotStatus::Active));
    for bot in &mut bots {
        bot.shutdown();
    }
}

#[test]
fn handshakes_run_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let launches = (0..4)
        .map(|i| sh(&format!("slow{i}"), "sleep 0.5; echo ready; sleep 5"))
        .collect();
    let start = Instant::now();
    let bots = engine.launch_all(launches, &SandboxPolicy::unrestricted());

    assert!(bots.iter().all(|bot| bot.status() == BotStatus::Active));
    // one after the other would take at least 2s
    assert!(start.elapsed() < Duration::from_millis(1800));
}

#[test]
fn simultaneous_turn_reports_each_bot() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let mut bots = engine.launch_all(
        vec![
            echo_bot("echo"),
            sh("silent", "echo ready; sleep 5"),
            LaunchDescriptor::new("ghost", "/nonexistent/bot"),
            echo_bot("echo2"),
        ],
        &SandboxPolicy::unrestricted(),
    );

    let deadline = Instant::now() + Duration::from_millis(500);
    let results = simultaneous_turn(&mut bots, b"turn:1", deadline);
    assert_eq!(results.len(), 4);
    assert_eq!(
        results[0].as_ref().unwrap(),
        &TurnOutcome::Move(b"turn:1".to_vec())
    );
    assert_eq!(results[1].as_ref().unwrap(), &TurnOutcome::NoMove);
    assert!(matches!(results[2], Err(SupervisorError::Disqualified)));
    assert_eq!(
        results[3].as_ref().unwrap(),
        &TurnOutcome::Move(b"turn:1".to_vec())
    );

    assert_eq!(bots[1].status(), BotStatus::Unresponsive);
    // the silent bot is skipped on the next turn
    let deadline = Instant::now() + Duration::from_millis(500);
    let results = simultaneous_turn(&mut bots, b"turn:2", deadline);
    assert!(matches!(
        results[1],
        Err(SupervisorError::NotActive(BotStatus::Unresponsive))
    ));
    assert_eq!(bots[0].moves(), [b"turn:1".to_vec(), b"turn:2".to_vec()]);
    assert_eq!(bots[1].turn(), 1);
}

#[test]
fn blocked_state_delivery_respects_the_turn_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let mut bots = engine.launch_all(
        vec![sh("deaf", "echo ready; sleep 30").with_move_timeout(Duration::from_secs(3))],
        &SandboxPolicy::unrestricted(),
    );
    assert_eq!(bots[0].status(), BotStatus::Active);

    // larger than any pipe buffer, and the bot never reads it
    let state = vec![b'x'; 256 * 1024];
    let start = Instant::now();
    let results = simultaneous_turn(&mut bots, &state, start + Duration::from_millis(200));

    assert!(matches!(
        results[0],
        Err(SupervisorError::Channel(ChannelError::Full))
    ));
    assert!(start.elapsed() < Duration::from_millis(1500));
    bots[0].shutdown();
}
