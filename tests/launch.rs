use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use agent_league::prelude::*;
use agent_league::protocol::messages::{methods, MoveOrigin};
use agent_league::protocol::Request;
use agent_league::standings::StandingsEntry;
use agent_league::tournament_scheduler::MatchStatus;
use serde_json::json;

use crate::harness::*;

mod harness;

const IDLE: Duration = Duration::from_secs(10);

#[test]
fn four_competitors_play_six_matches() {
    init_test_logger();
    let mut league = League::new(fast_config());
    league.add_supervisor("referee-1");
    league.add_supervisor("referee-2");
    for (id, value) in [("ann", "rock"), ("ben", "paper"), ("cat", "scissors"), ("dan", "rock")] {
        league.add_competitor(id, constant(value));
    }
    let seen = record(&league.events, "*");

    assert_eq!(league.start(), 6);
    let summary = league.manager.run(IDLE).unwrap();
    assert_eq!(summary.status, LeagueStatus::Completed);
    assert_eq!(summary.terminal_matches, 6);
    assert!(summary.scheduling_failures.is_empty());

    let matches = league.manager.matches();
    let pairs: HashSet<[String; 2]> = matches
        .iter()
        .map(|m| {
            let mut pair = m.competitors.clone();
            pair.sort();
            pair
        })
        .collect();
    assert_eq!(pairs.len(), 6);
    for m in &matches {
        assert_eq!(m.status, MatchStatus::Completed);
        let indices: Vec<u32> = m.rounds.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    let played: u32 = summary.standings.iter().map(|e| e.played).sum();
    assert_eq!(played, 12);
    assert_eq!(league.manager.standings(), league.manager.replay_standings());
    let ben = league.manager.competitor("ben").unwrap();
    assert_eq!(ben.head_to_head["ann"].wins, 1);
    let ann = league.manager.competitor("ann").unwrap();
    assert_eq!(ann.head_to_head["dan"].ties, 1);

    assert_eq!(count(&seen, topics::MATCH_COMPLETED), 6);
    assert_eq!(count(&seen, topics::MATCH_ASSIGNED), 6);
    assert_eq!(count(&seen, topics::LEAGUE_COMPLETED), 1);

    // final notices travel after the report
    assert!(eventually(Duration::from_secs(2), || {
        league
            .competitors
            .iter()
            .all(|c| c.finished_matches().len() == 3)
    }));
    let finished = league.competitor("ben").finished_matches();
    assert!(finished.iter().all(|m| m.rounds.len() == 3));

    let archived = league.manager.archive().unwrap();
    assert_eq!(archived.matches.len(), 6);
}

#[test]
fn three_timeouts_flag_the_slow_competitor() {
    let config = fast_config()
        .with_round_count(5)
        .with_misbehavior_threshold(3)
        .with_move_timeout(Duration::from_millis(100));
    let mut league = League::new(config);
    league.add_supervisor("referee");
    league.add_competitor("slow", Arc::new(Sleeper(Duration::from_millis(300))));
    league.add_competitor("quick", constant("paper"));
    let flagged = record(&league.events, topics::COMPETITOR_FLAGGED);

    league.start();
    league.manager.run(IDLE).unwrap();

    let m = &league.manager.matches()[0];
    assert_eq!(m.winner.as_deref(), Some("quick"));
    assert_eq!(m.flags.len(), 1);
    assert_eq!(m.flags[0].competitor_id, "slow");
    assert_eq!(m.flags[0].counters.timeouts, 3);
    assert_eq!(m.flags[0].flagged_at_round, 3);

    let indices: Vec<u32> = m.rounds.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    for round in &m.rounds[..3] {
        let slow = round.moves.iter().find(|mv| mv.competitor_id == "slow").unwrap();
        assert_eq!(slow.origin, MoveOrigin::TimeoutDefault);
        assert!(!slow.valid);
        assert!(!round.awarded);
    }
    for round in &m.rounds[3..] {
        assert!(round.awarded);
        assert_eq!(round.winner.as_deref(), Some("quick"));
    }
    assert_eq!(count(&flagged, topics::COMPETITOR_FLAGGED), 1);
    assert_eq!(league.manager.standings().get("quick").unwrap().points, 3);
}

#[test]
fn answers_at_the_deadline_edge_are_timing_anomalies() {
    let config = fast_config()
        .with_round_count(5)
        .with_misbehavior_threshold(3)
        .with_move_timeout(Duration::from_millis(400))
        .with_timing_anomaly_window(Duration::from_millis(250));
    let mut league = League::new(config);
    league.add_supervisor("referee");
    league.add_competitor("late", Arc::new(Sleeper(Duration::from_millis(220))));
    league.add_competitor("prompt", constant("rock"));

    league.start();
    league.manager.run(IDLE).unwrap();

    let m = &league.manager.matches()[0];
    assert_eq!(m.status, MatchStatus::Completed);
    assert_eq!(m.winner.as_deref(), Some("prompt"));
    assert_eq!(m.flags.len(), 1);
    assert_eq!(m.flags[0].competitor_id, "late");
    assert_eq!(m.flags[0].counters.timing_anomalies, 3);
    assert_eq!(m.flags[0].counters.timeouts, 0);
    assert_eq!(m.flags[0].flagged_at_round, 3);
    for round in &m.rounds[..3] {
        let late = round.moves.iter().find(|mv| mv.competitor_id == "late").unwrap();
        // the move still counts
        assert_eq!(late.origin, MoveOrigin::Submitted);
        assert!(late.valid);
    }
    assert_eq!(league.manager.standings().get("prompt").unwrap().points, 3);
}

#[test]
fn late_answers_outside_the_window_are_not_anomalies() {
    let config = fast_config()
        .with_round_count(5)
        .with_misbehavior_threshold(1)
        .with_move_timeout(Duration::from_millis(400))
        .with_timing_anomaly_window(Duration::from_millis(100));
    let mut league = League::new(config);
    league.add_supervisor("referee");
    league.add_competitor("late", Arc::new(Sleeper(Duration::from_millis(40))));
    league.add_competitor("prompt", constant("rock"));

    league.start();
    league.manager.run(IDLE).unwrap();

    let m = &league.manager.matches()[0];
    assert_eq!(m.status, MatchStatus::Completed);
    assert!(m.flags.is_empty());
    assert_eq!(m.winner, None);
    assert!(m.rounds.iter().all(|r| !r.awarded));
    assert_eq!(league.manager.standings().get("late").unwrap().ties, 1);
}

#[test]
fn flagging_follows_the_threshold() {
    for threshold in [1, 3, 10] {
        let config = fast_config()
            .with_round_count(12)
            .with_misbehavior_threshold(threshold);
        let mut league = League::new(config);
        league.add_supervisor("referee");
        league.add_competitor("cheat", Arc::new(Illegal));
        league.add_competitor("fair", constant("rock"));
        league.start();
        league.manager.run(IDLE).unwrap();

        let m = &league.manager.matches()[0];
        assert_eq!(m.winner.as_deref(), Some("fair"), "threshold {threshold}");
        assert_eq!(m.flags.len(), 1);
        assert_eq!(m.flags[0].flagged_at_round, threshold);
        assert_eq!(m.flags[0].counters.invalid_moves, threshold);
        assert_eq!(m.rounds.len(), 12);
        for round in &m.rounds {
            assert_eq!(round.awarded, round.index > threshold, "round {}", round.index);
        }
        let cheat = m.rounds[0]
            .moves
            .iter()
            .find(|mv| mv.competitor_id == "cheat")
            .unwrap();
        assert_eq!(cheat.origin, MoveOrigin::InvalidReplaced);
        assert_eq!(cheat.value, json!("rock"));
    }
}

#[test]
fn dead_supervisor_hands_its_match_to_a_healthy_one() {
    let mut league = League::new(fast_config());
    league.add_supervisor("referee-1");
    league.add_supervisor("referee-2");
    for id in ["ann", "ben", "cat", "dan"] {
        league.add_competitor(id, constant("rock"));
    }
    league.start();
    league.transport.set_unreachable("referee-1", true);

    let failures = league.manager.dispatch().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].match_id, "match-001");
    assert_eq!(failures[0].supervisor_id.as_deref(), Some("referee-1"));
    assert_eq!(failures[0].cause, ErrorCode::PeerUnavailable);

    for match_id in ["match-001", "match-002"] {
        let m = league.manager.match_record(match_id).unwrap();
        assert_eq!(m.status, MatchStatus::Assigned, "{match_id}");
        assert_eq!(m.supervisor_id.as_deref(), Some("referee-2"));
        assert!(!m.dispatch_failed);
    }

    let summary = league.manager.run(IDLE).unwrap();
    assert_eq!(summary.status, LeagueStatus::Completed);
    assert!(!summary.scheduling_failures.is_empty());
    assert!(summary
        .scheduling_failures
        .iter()
        .all(|f| f.supervisor_id.as_deref() == Some("referee-1")));
    assert!(league
        .manager
        .matches()
        .iter()
        .all(|m| m.supervisor_id.as_deref() == Some("referee-2")));
}

#[test]
fn unreachable_sole_supervisor_stalls_until_retried() {
    let mut league = League::new(fast_config());
    league.add_supervisor("referee");
    for id in ["ann", "ben", "cat", "dan"] {
        league.add_competitor(id, constant("rock"));
    }
    league.start();
    league.transport.set_unreachable("referee", true);

    match league.manager.run(IDLE) {
        Err(LeagueError::Stalled { unassigned, failures }) => {
            assert_eq!(unassigned.len(), 6);
            assert!(failures.iter().any(|f| f.match_id == "match-001"));
        }
        other => panic!("expected a stall, got {other:?}"),
    }
    let first = league.manager.match_record("match-001").unwrap();
    assert_eq!(first.status, MatchStatus::Unassigned);
    assert!(first.dispatch_failed);

    league.transport.set_unreachable("referee", false);
    assert!(league.manager.retry_unassigned().unwrap().is_empty());
    let summary = league.manager.run(IDLE).unwrap();
    assert_eq!(summary.status, LeagueStatus::Completed);
    assert!(!summary.scheduling_failures.is_empty());
}

#[test]
fn breaker_opens_on_a_dead_supervisor() {
    let config = fast_config()
        .with_retry_max_attempts(1)
        .with_circuit_breaker(2, Duration::from_secs(60), Duration::from_secs(60));
    let mut league = League::new(config);
    league.add_supervisor("referee");
    league.add_competitor("ann", constant("rock"));
    league.add_competitor("ben", constant("paper"));
    league.start();
    league.transport.set_unreachable("referee", true);

    assert_eq!(league.manager.dispatch().unwrap().len(), 1);
    assert_eq!(league.manager.breaker_state("referee"), BreakerState::Closed);
    assert_eq!(league.manager.retry_unassigned().unwrap().len(), 1);
    assert_eq!(league.manager.breaker_state("referee"), BreakerState::Open);

    // the peer is no longer contacted at all
    let failures = league.manager.retry_unassigned().unwrap();
    assert_eq!(failures[0].cause, ErrorCode::PeerUnavailable);
    assert!(failures[0].message.contains("circuit open"));
}

#[test]
fn duplicate_registration_keeps_the_original_token() {
    let mut league = League::new(fast_config());
    let token = league
        .add_competitor("ann", constant("rock"))
        .token()
        .unwrap();

    let impostor = Competitor::new(
        "ann",
        "Impostor",
        constant("paper"),
        &league.config,
        Arc::new(league.transport.clone()),
    );
    let err = impostor.register(LEAGUE_ID).unwrap_err();
    assert_eq!(err.code, ErrorCode::DuplicateId);
    assert_eq!(league.manager.validate_token(&token).unwrap().owner_id, "ann");
    assert_eq!(league.manager.competitor("ann").unwrap().display_name, "ANN");
}

#[test]
fn declined_invitation_forfeits_the_match() {
    let mut league = League::new(fast_config());
    league.add_supervisor("referee");
    league.add_competitor("shy", Arc::new(Shy));
    league.add_competitor("keen", constant("rock"));
    let forfeits = record(&league.events, "match.*");
    league.start();
    league.manager.run(IDLE).unwrap();

    let m = &league.manager.matches()[0];
    assert_eq!(m.status, MatchStatus::Forfeited);
    assert_eq!(m.forfeit_cause.as_deref(), Some("shy"));
    assert_eq!(m.winner.as_deref(), Some("keen"));
    assert!(m.rounds.is_empty());
    assert_eq!(count(&forfeits, topics::MATCH_FORFEITED), 1);

    let keen = league.manager.standings().get("keen").cloned().unwrap();
    assert_eq!((keen.wins, keen.points), (1, 3));
    assert_eq!(league.manager.standings(), league.manager.replay_standings());
}

#[test]
fn paused_league_resumes_where_it_stopped() {
    let mut league = League::new(fast_config().with_max_concurrent_matches(1));
    league.add_supervisor("referee");
    for id in ["ann", "ben", "cat"] {
        league.add_competitor(id, constant("rock"));
    }
    let seen = record(&league.events, "league.*");
    league.start();
    league.manager.pause().unwrap();

    let paused = league.manager.run(IDLE).unwrap();
    assert_eq!(paused.status, LeagueStatus::Paused);
    assert_eq!(paused.terminal_matches, 0);

    league.manager.resume().unwrap();
    let summary = league.manager.run(IDLE).unwrap();
    assert_eq!(summary.status, LeagueStatus::Completed);
    assert_eq!(summary.terminal_matches, 3);
    assert!(summary.standings.iter().all(|e| e.ties == 2));
    assert_eq!(count(&seen, topics::LEAGUE_PAUSED), 1);
    assert_eq!(count(&seen, topics::LEAGUE_RESUMED), 1);
    assert!(league.manager.pause().is_err());
}

#[test]
fn cancelled_match_leaves_the_table_untouched() {
    let config = fast_config()
        .with_round_count(30)
        .with_move_timeout(Duration::from_millis(200));
    let mut league = League::new(config);
    league.add_supervisor("referee");
    league.add_competitor("ann", Arc::new(Sleeper(Duration::from_millis(20))));
    league.add_competitor("ben", Arc::new(Sleeper(Duration::from_millis(20))));
    league.start();

    assert!(league.manager.dispatch().unwrap().is_empty());
    thread::sleep(Duration::from_millis(100));
    league.manager.cancel_match("match-001", "operator request").unwrap();
    let summary = league.manager.run(IDLE).unwrap();

    assert_eq!(summary.status, LeagueStatus::Completed);
    let m = league.manager.match_record("match-001").unwrap();
    assert_eq!(m.status, MatchStatus::Forfeited);
    assert_eq!(m.forfeit_cause, None);
    assert!(m.forfeit_reason.unwrap().contains("operator request"));
    assert!(summary.standings.iter().all(|e| e.played == 0));
}

#[test]
fn lost_report_is_reconciled_instead_of_hanging() {
    let mut league = League::new(fast_config().with_report_retry_rounds(1));
    league.add_supervisor("referee");
    league.add_competitor("ann", Arc::new(Sleeper(Duration::from_millis(50))));
    league.add_competitor("ben", constant("paper"));
    let seen = record(&league.events, "match.*");
    league.start();

    assert!(league.manager.dispatch().unwrap().is_empty());
    league.transport.set_unreachable(LEAGUE_ID, true);
    assert!(eventually(Duration::from_secs(5), || {
        league.supervisors[0].status().dropped_reports == vec!["match-001".to_string()]
    }));
    assert_eq!(count(&seen, topics::MATCH_REPORT_DROPPED), 1);
    assert_eq!(
        league.manager.match_record("match-001").unwrap().status,
        MatchStatus::Assigned
    );

    league.transport.set_unreachable(LEAGUE_ID, false);
    let summary = league.manager.run(Duration::from_millis(200)).unwrap();
    assert_eq!(summary.status, LeagueStatus::Completed);
    let m = league.manager.match_record("match-001").unwrap();
    assert_eq!(m.status, MatchStatus::Forfeited);
    assert_eq!(m.winner, None);
    assert_eq!(m.forfeit_cause, None);
    assert_eq!(m.forfeit_reason.as_deref(), Some("result report lost"));
    assert!(summary.standings.iter().all(|e| e.played == 0));
    assert_eq!(league.manager.supervisors()[0].load, 0);
    assert_eq!(count(&seen, topics::MATCH_FORFEITED), 1);

    // already settled: nothing left to reconcile
    assert_eq!(league.manager.reconcile(), 0);
}

#[test]
fn league_over_tcp() {
    let config = fast_config();
    let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new());
    let events = EventBus::new();

    let manager = LeagueManager::new(LEAGUE_ID, config.clone(), transport.clone(), events.clone());
    let league_server = TcpServer::bind("127.0.0.1:0", manager.service()).unwrap();
    let league_endpoint = league_server.endpoint();
    manager.initialize().unwrap();
    manager.open_registration().unwrap();

    let referee = Supervisor::new("referee", &config, transport.clone(), events);
    let referee_server = TcpServer::bind("127.0.0.1:0", referee.service()).unwrap();
    referee.set_endpoint(referee_server.endpoint());
    referee.register(&league_endpoint).unwrap();

    let mut players = vec![];
    for (id, value) in [("ann", "rock"), ("ben", "paper"), ("cat", "scissors")] {
        let player = Competitor::new(id, id, constant(value), &config, transport.clone());
        let server = TcpServer::bind("127.0.0.1:0", player.service()).unwrap();
        player.set_endpoint(server.endpoint());
        player.register(&league_endpoint).unwrap();
        players.push((player, server));
    }

    assert_eq!(manager.schedule().unwrap(), 3);
    manager.start().unwrap();
    let summary = manager.run(IDLE).unwrap();
    assert_eq!(summary.status, LeagueStatus::Completed);

    let reply = transport
        .call(
            &league_endpoint,
            &Request::new(methods::GET_STANDINGS, json!({ "league_id": LEAGUE_ID }), "q-1"),
            Duration::from_secs(1),
        )
        .unwrap();
    let table: Vec<StandingsEntry> = serde_json::from_value(reply.into_result().unwrap()).unwrap();
    assert_eq!(table.len(), 3);
    assert!(table.iter().all(|e| e.wins == 1 && e.points == 3));
    assert_eq!(table[0].competitor_id, "ann");

    let reply = transport
        .call(
            &league_endpoint,
            &Request::new(methods::GET_STANDINGS, json!({ "league_id": "elsewhere" }), "q-2"),
            Duration::from_secs(1),
        )
        .unwrap();
    assert_eq!(reply.into_result().unwrap_err().code, ErrorCode::NotFound);
}
