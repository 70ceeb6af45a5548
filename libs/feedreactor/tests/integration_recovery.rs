//! Integration tests for reconnection and failover

mod common;

use common::{new_reactor, pump_for, pump_until, EventLog, ScriptedServer, WAIT};
use feedreactor::rdm::{
    DirectoryMsg, DirectoryRefresh, DirectoryRequest, LoginMsg, LoginRefresh, LoginRequest, RdmMsg,
    ServiceInfo, State,
};
use feedreactor::{
    AcceptOptions, ChannelEventType, ChannelId, ChannelState, Connector, ConnectOptions,
    ConnectionTarget, ContainerType, DomainType, LoopbackConfig, LoopbackListener,
    LoopbackNetwork, Msg, MsgClass, PreferredHostOptions, Reactor, ReactorError, Role,
    SubmitOptions, TargetOrigin, WarmStandbyGroup,
};
use serde_json::json;
use std::time::Duration;

use ChannelEventType::*;

fn primary() -> ConnectionTarget {
    ConnectionTarget::new("feed", "14002")
}

fn backup() -> ConnectionTarget {
    ConnectionTarget::new("feed", "14003")
}

fn item_request(stream_id: i32, name: &str) -> Msg {
    Msg::new(MsgClass::Request, DomainType::MarketPrice, stream_id)
        .with_body(ContainerType::ElementList, json!({ "name": name }))
}

#[test]
fn test_reconnect_limit_bounds_down_reconnecting_events() {
    let network = LoopbackNetwork::new();
    let mut reactor = new_reactor(&network);
    let log = EventLog::new();

    let channel = reactor
        .connect(
            ConnectOptions::single(primary()).with_reconnect(2, 10, 20),
            log.consumer(),
        )
        .unwrap();
    assert_eq!(
        reactor.channel_state(channel).unwrap(),
        ChannelState::DownReconnecting
    );

    assert!(pump_until(&mut reactor, WAIT, || log.has(ChannelDown)));
    pump_for(&mut reactor, Duration::from_millis(50));
    assert_eq!(
        log.event_types(),
        vec![
            ChannelOpened,
            ChannelDownReconnecting,
            ChannelDownReconnecting,
            ChannelDown
        ]
    );
    assert_eq!(reactor.channel_state(channel).unwrap(), ChannelState::Down);
}

#[test]
fn test_backoff_delays_between_attempts() {
    verbose_println!("Testing reconnect backoff timing...");

    let network = LoopbackNetwork::new();
    let mut reactor = new_reactor(&network);
    let log = EventLog::new();

    let channel = reactor
        .connect(
            ConnectOptions::single(primary()).with_reconnect(4, 50, 120),
            log.consumer(),
        )
        .unwrap();
    assert!(pump_until(&mut reactor, WAIT, || log.has(ChannelDown)));

    // Each failure is followed by the next attempt after min(max, min * 2^(i-1))
    let expected = [0u64, 50, 100, 120];
    let slack = Duration::from_millis(75);
    let timeline: Vec<_> = log
        .timeline()
        .into_iter()
        .filter(|(t, _)| matches!(t, ChannelDownReconnecting | ChannelDown))
        .collect();
    assert_eq!(timeline.len(), expected.len() + 1);
    assert_eq!(timeline.last().unwrap().0, ChannelDown);

    for (i, window) in timeline.windows(2).enumerate() {
        let gap = window[1].1.duration_since(window[0].1);
        let computed = Duration::from_millis(expected[i]);
        verbose_println!("  attempt {}: waited {:?} (computed {:?})", i + 1, gap, computed);
        assert!(gap >= computed, "attempt {} waited {:?} < {:?}", i + 1, gap, computed);
        assert!(
            gap <= computed + slack,
            "attempt {} waited {:?} > {:?} + slack",
            i + 1,
            gap,
            computed
        );
    }

    assert_eq!(reactor.channel_info(channel).unwrap().reconnect_attempts, 4);
    assert_eq!(reactor.channel_stats(channel).unwrap().reconnects, 4);
}

#[test]
fn test_attempts_reset_after_successful_connection() {
    let network = LoopbackNetwork::new();
    let listener = network.listen("feed", "14002");
    let mut reactor = new_reactor(&network);
    let log = EventLog::new();

    let channel = reactor
        .connect(
            ConnectOptions::single(primary()).with_reconnect(1, 10, 20),
            log.consumer(),
        )
        .unwrap();
    let first = ScriptedServer::accept(&mut reactor, &listener, WAIT);
    assert!(pump_until(&mut reactor, WAIT, || log.has(ChannelReady)));

    first.close();
    let second = ScriptedServer::accept(&mut reactor, &listener, WAIT);
    assert!(pump_until(&mut reactor, WAIT, || log.count(ChannelReady) == 2));
    assert_eq!(reactor.channel_info(channel).unwrap().reconnect_attempts, 0);

    // The single allowed attempt is available again
    second.close();
    let _third = ScriptedServer::accept(&mut reactor, &listener, WAIT);
    assert!(pump_until(&mut reactor, WAIT, || log.count(ChannelReady) == 3));
    assert_eq!(log.count(ChannelDown), 0);
    assert_eq!(log.count(ChannelDownReconnecting), 2);
}

#[test]
fn test_ping_timeout_takes_channel_down() {
    let network = LoopbackNetwork::new();
    let listener = network.listen_with(
        "feed",
        "14002",
        LoopbackConfig::default().with_ping_timeout(Duration::from_millis(100)),
    );
    let mut reactor = new_reactor(&network);
    let log = EventLog::new();
    let channel = reactor
        .connect(ConnectOptions::single(primary()), log.consumer())
        .unwrap();
    let _server = ScriptedServer::accept(&mut reactor, &listener, WAIT);
    assert!(pump_until(&mut reactor, WAIT, || log.has(ChannelUp)));
    assert_eq!(
        reactor.channel_info(channel).unwrap().ping_timeout,
        Some(Duration::from_millis(100))
    );

    assert!(pump_until(&mut reactor, WAIT, || log.has(ChannelDown)));
    assert_eq!(
        log.event_types(),
        vec![ChannelOpened, ChannelUp, ChannelReady, ChannelDown]
    );
    let (_, error) = log.errors().remove(0);
    assert_eq!(error.location, "Reactor.ping");
}

#[test]
fn test_initialization_timeout() {
    let network = LoopbackNetwork::new();
    let _listener = network.listen_with(
        "feed",
        "14002",
        LoopbackConfig::default().with_never_complete(),
    );
    let mut reactor = new_reactor(&network);
    let log = EventLog::new();
    reactor
        .connect(
            ConnectOptions::single(primary().with_init_timeout(1)),
            log.consumer(),
        )
        .unwrap();

    assert!(pump_until(&mut reactor, WAIT, || log.has(ChannelDown)));
    assert_eq!(log.event_types(), vec![ChannelOpened, ChannelDown]);
    let (_, error) = log.errors().remove(0);
    assert_eq!(error.location, "Reactor.initializeChannel");
    assert!(error.text.contains("1000 ms"), "{}", error.text);
}

#[test]
fn test_connection_list_failover_replays_requests() {
    let network = LoopbackNetwork::new();
    let primary_listener = network.listen("feed", "14002");
    let backup_listener = network.listen("feed", "14003");
    let mut reactor = new_reactor(&network);
    let log = EventLog::new();

    let channel = reactor
        .connect(
            ConnectOptions::single(primary())
                .with_target(backup())
                .with_reconnect(-1, 10, 50),
            log.consumer(),
        )
        .unwrap();
    let primary_server = ScriptedServer::accept(&mut reactor, &primary_listener, WAIT);
    assert!(pump_until(&mut reactor, WAIT, || log.has(ChannelReady)));
    reactor
        .submit(channel, item_request(5, "EUR="), &SubmitOptions::default())
        .unwrap();
    assert_eq!(primary_server.recv(&mut reactor, WAIT).stream_id, 5);

    primary_server.close();
    let backup_server = ScriptedServer::accept(&mut reactor, &backup_listener, WAIT);
    let replayed = backup_server.recv(&mut reactor, WAIT);
    assert_eq!(replayed.stream_id, 5);
    assert_eq!(replayed.body["name"], json!("EUR="));

    assert_eq!(
        log.event_types(),
        vec![
            ChannelOpened,
            ChannelUp,
            ChannelReady,
            ChannelDownReconnecting,
            ChannelUp,
            ChannelReady
        ]
    );
    let info = reactor.channel_info(channel).unwrap();
    assert_eq!(info.target, Some(backup()));
    assert_eq!(info.target_origin, Some(TargetOrigin::ConnectionList { index: 1 }));
}

#[test]
fn test_warm_standby_promotion() {
    verbose_println!("Testing warm standby promotion...");

    let network = LoopbackNetwork::new();
    let active_listener = network.listen("feed", "14002");
    let standby_listener = network.listen("feed", "14003");
    let mut reactor = new_reactor(&network);
    let log = EventLog::new();

    let options = ConnectOptions::default()
        .with_warm_standby_group(WarmStandbyGroup::new(primary()).with_standby(backup()))
        .with_reconnect(-1, 10, 50);
    let channel = reactor.connect(options, log.consumer()).unwrap();
    let active = ScriptedServer::accept(&mut reactor, &active_listener, WAIT);
    assert!(pump_until(&mut reactor, WAIT, || log.has(ChannelReady)));
    assert_eq!(
        reactor.channel_info(channel).unwrap().active_standby,
        Some((0, 0))
    );

    reactor
        .submit(channel, item_request(7, "VOD.L"), &SubmitOptions::default())
        .unwrap();
    assert_eq!(active.recv(&mut reactor, WAIT).stream_id, 7);
    // Cold standby: nothing connects to the standby while the active serves
    assert_eq!(standby_listener.pending(), 0);
    assert!(network.client_ends("feed", "14003").is_empty());

    active.close();
    let standby = ScriptedServer::accept(&mut reactor, &standby_listener, WAIT);
    assert_eq!(standby.recv(&mut reactor, WAIT).stream_id, 7);

    let info = reactor.channel_info(channel).unwrap();
    assert_eq!(info.state, ChannelState::Ready);
    assert_eq!(info.active_standby, Some((0, 1)));
    assert_eq!(
        info.target_origin,
        Some(TargetOrigin::WarmStandby { group: 0, member: 1 })
    );
    assert_eq!(log.count(ChannelReady), 2);
}

#[test]
fn test_preferred_host_fallback_on_detection_timer() {
    verbose_println!("Testing preferred host fallback...");

    let network = LoopbackNetwork::new();
    let backup_listener = network.listen("feed", "14003");
    let mut reactor = new_reactor(&network);
    let log = EventLog::new();

    let options = ConnectOptions::single(primary())
        .with_target(backup())
        .with_reconnect(-1, 10, 50)
        .with_preferred_host(PreferredHostOptions {
            enabled: true,
            detection_interval_ms: 50,
            connection_list_index: 0,
            warm_standby_group_index: 0,
        });
    let channel = reactor.connect(options, log.consumer()).unwrap();

    // Primary is down at first, so the channel settles on the backup
    let backup_server = ScriptedServer::accept(&mut reactor, &backup_listener, WAIT);
    let primary_listener = network.listen("feed", "14002");
    assert!(pump_until(&mut reactor, WAIT, || log.has(ChannelReady)));
    assert_eq!(
        reactor.channel_info(channel).unwrap().target_origin,
        Some(TargetOrigin::ConnectionList { index: 1 })
    );

    let _primary_server = ScriptedServer::accept(&mut reactor, &primary_listener, WAIT);
    assert!(pump_until(&mut reactor, WAIT, || log.has(PreferredHostComplete)));
    assert_eq!(
        log.event_types(),
        vec![
            ChannelOpened,
            ChannelDownReconnecting,
            ChannelUp,
            ChannelReady,
            PreferredHostStartingFallback,
            ChannelUp,
            ChannelReady,
            PreferredHostComplete
        ]
    );
    assert!(backup_server.transport.peer_closed());
    let info = reactor.channel_info(channel).unwrap();
    assert_eq!(info.target_origin, Some(TargetOrigin::ConnectionList { index: 0 }));
    assert_eq!(info.reconnect_attempts, 0);

    // Back on the preferred target, the check stays quiet
    pump_for(&mut reactor, Duration::from_millis(150));
    assert_eq!(log.count(PreferredHostStartingFallback), 1);
}

#[test]
fn test_manual_preferred_host_fallback() {
    let network = LoopbackNetwork::new();
    let backup_listener = network.listen("feed", "14003");
    let mut reactor = new_reactor(&network);
    let log = EventLog::new();

    let options = ConnectOptions::single(primary())
        .with_target(backup())
        .with_reconnect(-1, 10, 50)
        .with_preferred_host(PreferredHostOptions {
            enabled: true,
            ..Default::default()
        });
    let channel = reactor.connect(options, log.consumer()).unwrap();
    let _backup_server = ScriptedServer::accept(&mut reactor, &backup_listener, WAIT);
    assert!(pump_until(&mut reactor, WAIT, || log.has(ChannelReady)));

    let primary_listener = network.listen("feed", "14002");
    pump_for(&mut reactor, Duration::from_millis(100));
    assert!(!log.has(PreferredHostStartingFallback));

    reactor.fallback_preferred_host(channel).unwrap();
    assert!(log.has(PreferredHostStartingFallback));
    let _primary_server = ScriptedServer::accept(&mut reactor, &primary_listener, WAIT);
    assert!(pump_until(&mut reactor, WAIT, || log.has(PreferredHostComplete)));

    // Already preferred: nothing to do
    reactor.fallback_preferred_host(channel).unwrap();
    assert_eq!(log.count(PreferredHostStartingFallback), 1);
}

#[test]
fn test_manual_fallback_requires_preferred_host() {
    let network = LoopbackNetwork::new();
    let listener = network.listen("feed", "14002");
    let mut reactor = new_reactor(&network);
    let log = EventLog::new();
    let channel = reactor
        .connect(ConnectOptions::single(primary()), log.consumer())
        .unwrap();
    let _server = ScriptedServer::accept(&mut reactor, &listener, WAIT);
    assert!(pump_until(&mut reactor, WAIT, || log.has(ChannelReady)));

    assert!(matches!(
        reactor.fallback_preferred_host(channel),
        Err(ReactorError::ParameterInvalid(_))
    ));
    assert_eq!(reactor.channel_state(channel).unwrap(), ChannelState::Ready);
}

#[test]
fn test_close_while_reconnecting_stops_recovery() {
    let network = LoopbackNetwork::new();
    let mut reactor = new_reactor(&network);
    let log = EventLog::new();
    let channel = reactor
        .connect(
            ConnectOptions::single(primary()).with_reconnect(-1, 200, 400),
            log.consumer(),
        )
        .unwrap();
    assert!(pump_until(&mut reactor, WAIT, || log.count(ChannelDownReconnecting) == 2));

    reactor.close_channel(channel).unwrap();
    let before = log.event_types().len();
    let _listener = network.listen("feed", "14002");
    pump_for(&mut reactor, Duration::from_millis(500));

    assert_eq!(log.event_types().len(), before);
    assert!(reactor.channel_ids().is_empty());
    assert!(network.client_ends("feed", "14002").is_empty());
}

#[test]
fn test_server_channel_goes_down_without_recovery() {
    let network = LoopbackNetwork::new();
    let listener = network.listen("feed", "14002");
    let mut reactor = new_reactor(&network);
    let log = EventLog::new();

    let client = network.connect(&primary()).unwrap();
    let server = reactor
        .accept(&listener, AcceptOptions::default(), log.attach(Role::provider()))
        .unwrap();
    assert!(pump_until(&mut reactor, WAIT, || log.has(ChannelReady)));

    client.close();
    assert!(pump_until(&mut reactor, WAIT, || log.has(ChannelDown)));
    pump_for(&mut reactor, Duration::from_millis(50));
    assert_eq!(
        log.events_for(server),
        vec![ChannelUp, ChannelReady, ChannelDown]
    );
    assert!(!log.has(ChannelDownReconnecting));
    assert!(reactor.channel_info(server).unwrap().server);
}

/// Consumer on primary then backup, already READY on the primary
struct Failover {
    network: LoopbackNetwork,
    backup_listener: LoopbackListener,
    reactor: Reactor,
    log: EventLog,
    channel: ChannelId,
    primary_server: ScriptedServer,
}

fn failover_pair(role: impl FnOnce(&EventLog) -> Role, services: Vec<ServiceInfo>) -> Failover {
    let network = LoopbackNetwork::new();
    let primary_listener = network.listen("feed", "14002");
    let backup_listener = network.listen("feed", "14003");
    let mut reactor = new_reactor(&network);
    let log = EventLog::new();
    let channel = reactor
        .connect(
            ConnectOptions::single(primary())
                .with_target(backup())
                .with_reconnect(-1, 10, 50),
            role(&log),
        )
        .unwrap();
    let primary_server = ScriptedServer::accept(&mut reactor, &primary_listener, WAIT);
    if !services.is_empty() {
        complete_session(&primary_server, &mut reactor, services);
    }
    assert!(pump_until(&mut reactor, WAIT, || log.has(ChannelReady)));
    Failover {
        network,
        backup_listener,
        reactor,
        log,
        channel,
        primary_server,
    }
}

/// Answer the login and directory requests of a consumer
fn complete_session(server: &ScriptedServer, reactor: &mut Reactor, services: Vec<ServiceInfo>) {
    let login = server.recv(reactor, WAIT);
    assert_eq!(login.domain, DomainType::Login);
    server.send_rdm(RdmMsg::Login(LoginMsg::Refresh(LoginRefresh::accepted("trader"))));
    let directory = server.recv(reactor, WAIT);
    assert_eq!(directory.domain, DomainType::Source);
    server.send_rdm(RdmMsg::Directory(DirectoryMsg::Refresh(DirectoryRefresh::new(
        services,
    ))));
}

fn session_consumer(log: &EventLog) -> Role {
    log.attach(
        Role::consumer()
            .with_login(LoginRequest::new("trader"))
            .with_directory(DirectoryRequest::default()),
    )
}

#[test]
fn test_rejected_submit_is_not_replayed() {
    let Failover {
        network: _network,
        backup_listener,
        mut reactor,
        log,
        channel,
        primary_server,
    } = failover_pair(|log| log.consumer(), Vec::new());

    let oversized = item_request(2, &"X".repeat(10_000));
    assert!(matches!(
        reactor.submit(channel, oversized, &SubmitOptions::default()),
        Err(ReactorError::BufferTooSmall(_))
    ));
    assert_eq!(reactor.channel_info(channel).unwrap().open_subscriptions, 0);

    reactor
        .submit(channel, item_request(5, "EUR="), &SubmitOptions::default())
        .unwrap();
    assert_eq!(primary_server.recv(&mut reactor, WAIT).stream_id, 5);
    assert_eq!(reactor.channel_info(channel).unwrap().open_subscriptions, 1);

    primary_server.close();
    let backup_server = ScriptedServer::accept(&mut reactor, &backup_listener, WAIT);
    assert_eq!(backup_server.recv(&mut reactor, WAIT).stream_id, 5);
    pump_for(&mut reactor, Duration::from_millis(50));
    assert!(backup_server.try_recv().is_none());
    assert!(!log.has(Warning));
    assert_eq!(log.count(ChannelReady), 2);
}

#[test]
fn test_replay_resolves_service_names_against_new_directory() {
    let Failover {
        network: _network,
        backup_listener,
        mut reactor,
        log,
        channel,
        primary_server,
    } = failover_pair(
        session_consumer,
        vec![ServiceInfo::new(3, "FEED"), ServiceInfo::new(4, "NEWS")],
    );

    reactor
        .submit(channel, item_request(5, "EUR="), &SubmitOptions::for_service("FEED"))
        .unwrap();
    reactor
        .submit(channel, item_request(6, "HEADLINES"), &SubmitOptions::for_service("NEWS"))
        .unwrap();
    reactor
        .submit(channel, item_request(7, "JPY="), &SubmitOptions::for_service("FEED"))
        .unwrap();
    let sent: Vec<_> = (0..3)
        .map(|_| {
            let msg = primary_server.recv(&mut reactor, WAIT);
            (msg.stream_id, msg.service_id)
        })
        .collect();
    assert_eq!(sent, vec![(5, Some(3)), (6, Some(4)), (7, Some(3))]);

    // The backup numbers FEED differently and has no NEWS
    primary_server.close();
    let backup_server = ScriptedServer::accept(&mut reactor, &backup_listener, WAIT);
    complete_session(&backup_server, &mut reactor, vec![ServiceInfo::new(9, "FEED")]);

    let first = backup_server.recv(&mut reactor, WAIT);
    let second = backup_server.recv(&mut reactor, WAIT);
    assert_eq!((first.stream_id, first.service_id), (5, Some(9)));
    assert_eq!((second.stream_id, second.service_id), (7, Some(9)));

    let warnings: Vec<_> = log
        .errors()
        .into_iter()
        .filter(|(t, _)| *t == Warning)
        .map(|(_, e)| e)
        .collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].location, "Reactor.replay");
    assert!(warnings[0].text.contains("stream 6"), "{}", warnings[0].text);

    let info = reactor.channel_info(channel).unwrap();
    assert_eq!(info.state, ChannelState::Ready);
    // The unresolved stream stays open for the next reconnection
    assert_eq!(info.open_subscriptions, 3);
}

#[test]
fn test_stream_closed_by_provider_is_not_replayed() {
    let Failover {
        network: _network,
        backup_listener,
        mut reactor,
        log,
        channel,
        primary_server,
    } = failover_pair(|log| log.consumer(), Vec::new());

    for (stream_id, name) in [(5, "EUR="), (6, "JPY="), (7, "GBP=")] {
        reactor
            .submit(channel, item_request(stream_id, name), &SubmitOptions::default())
            .unwrap();
        primary_server.recv(&mut reactor, WAIT);
    }
    assert_eq!(reactor.channel_info(channel).unwrap().open_subscriptions, 3);

    primary_server.send(
        &Msg::new(MsgClass::Status, DomainType::MarketPrice, 6).with_body(
            ContainerType::ElementList,
            json!({ "state": State::closed("item not found") }),
        ),
    );
    primary_server.send(&Msg::new(MsgClass::Close, DomainType::MarketPrice, 7));
    assert!(pump_until(&mut reactor, WAIT, || {
        log.with(|r| r.default_msgs.len()) == 2
    }));
    assert_eq!(reactor.channel_info(channel).unwrap().open_subscriptions, 1);

    primary_server.close();
    let backup_server = ScriptedServer::accept(&mut reactor, &backup_listener, WAIT);
    assert_eq!(backup_server.recv(&mut reactor, WAIT).stream_id, 5);
    pump_for(&mut reactor, Duration::from_millis(50));
    assert!(backup_server.try_recv().is_none());
}
