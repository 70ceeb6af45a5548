//! Integration tests for session setup
//!
//! These tests drive a consumer channel through login, directory and
//! dictionary exchanges against a scripted server.

mod common;

use common::{new_reactor, pump_for, pump_until, EventLog, ScriptedServer, WAIT};
use feedreactor::rdm::{
    DictionaryMsg, DictionaryRefresh, DictionaryType, DirectoryMsg, DirectoryRefresh,
    DirectoryRequest, LoginMsg, LoginRefresh, LoginRequest, LoginRtt, RdmMsg, ServiceInfo, State,
    ENUM_DICTIONARY_STREAM_ID, FIELD_DICTIONARY_STREAM_ID, LOGIN_STREAM_ID,
};
use feedreactor::{
    AcceptOptions, CallbackReturn, ChannelEventType, ConnectOptions, ConnectionTarget,
    ContainerType, DictionaryDownloadMode, DomainType, LoopbackNetwork, Msg, MsgClass, Payload,
    Role, SubmitOptions,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use ChannelEventType::*;

fn target() -> ConnectOptions {
    ConnectOptions::single(ConnectionTarget::new("feed", "14002"))
}

fn dictionary_refresh(stream_id: i32, name: &str, dictionary_type: DictionaryType) -> RdmMsg {
    RdmMsg::Dictionary(DictionaryMsg::Refresh(DictionaryRefresh {
        stream_id,
        service_id: 7,
        complete: true,
        name: name.to_string(),
        dictionary_type,
        state: State::open_ok(),
        payload: json!({"rows": 2}),
    }))
}

#[test]
fn test_consumer_session_order_with_dictionary_download() {
    verbose_println!("Testing login, directory and dictionary ordering...");

    let network = LoopbackNetwork::new();
    let listener = network.listen("feed", "14002");
    let mut reactor = new_reactor(&network);
    let log = EventLog::new();
    let role = log.attach(
        Role::consumer()
            .with_login(LoginRequest::new("trader"))
            .with_directory(DirectoryRequest::default())
            .with_dictionary_download(DictionaryDownloadMode::FirstAvailable),
    );
    let channel = reactor.connect(target(), role).unwrap();
    let server = ScriptedServer::accept(&mut reactor, &listener, WAIT);

    let login = server.recv(&mut reactor, WAIT);
    assert_eq!(login.domain, DomainType::Login);
    assert_eq!(login.msg_class, MsgClass::Request);
    assert_eq!(login.stream_id, LOGIN_STREAM_ID);
    assert_eq!(log.event_types(), vec![ChannelOpened, ChannelUp]);

    server.send_rdm(RdmMsg::Login(LoginMsg::Refresh(LoginRefresh::accepted("trader"))));
    let directory = server.recv(&mut reactor, WAIT);
    assert_eq!(directory.domain, DomainType::Source);
    assert_eq!(directory.msg_class, MsgClass::Request);

    server.send_rdm(RdmMsg::Directory(DirectoryMsg::Refresh(DirectoryRefresh::new(vec![
        ServiceInfo::new(1, "FEED"),
        ServiceInfo::new(7, "DICT").with_dictionaries(&["RWFFld", "RWFEnum"]),
    ]))));
    let field = server.recv(&mut reactor, WAIT);
    let enums = server.recv(&mut reactor, WAIT);
    assert_eq!(field.domain, DomainType::Dictionary);
    assert_eq!(field.stream_id, FIELD_DICTIONARY_STREAM_ID);
    assert_eq!(field.service_id, Some(7));
    assert_eq!(enums.stream_id, ENUM_DICTIONARY_STREAM_ID);
    assert!(!log.has(ChannelReady));

    server.send_rdm(dictionary_refresh(
        FIELD_DICTIONARY_STREAM_ID,
        "RWFFld",
        DictionaryType::FieldDefinitions,
    ));
    pump_for(&mut reactor, Duration::from_millis(30));
    assert!(!log.has(ChannelReady), "ready before both dictionaries");

    server.send_rdm(dictionary_refresh(
        ENUM_DICTIONARY_STREAM_ID,
        "RWFEnum",
        DictionaryType::EnumTables,
    ));
    let close_field = server.recv(&mut reactor, WAIT);
    let close_enum = server.recv(&mut reactor, WAIT);
    assert_eq!(close_field.msg_class, MsgClass::Close);
    assert_eq!(close_field.stream_id, FIELD_DICTIONARY_STREAM_ID);
    assert_eq!(close_enum.stream_id, ENUM_DICTIONARY_STREAM_ID);

    assert!(pump_until(&mut reactor, WAIT, || log.has(ChannelReady)));
    pump_for(&mut reactor, Duration::from_millis(30));
    assert_eq!(log.event_types(), vec![ChannelOpened, ChannelUp, ChannelReady]);

    log.with(|r| {
        assert_eq!(r.login_msgs.len(), 1);
        assert_eq!(r.directory_msgs.len(), 1);
        assert_eq!(r.dictionary_msgs.len(), 2);
        assert!(r.default_msgs.is_empty());
    });
    assert_eq!(reactor.channel_info(channel).unwrap().services.len(), 2);
}

#[test]
fn test_dictionary_download_unsupported_warns_and_continues() {
    let network = LoopbackNetwork::new();
    let listener = network.listen("feed", "14002");
    let mut reactor = new_reactor(&network);
    let log = EventLog::new();
    let role = log.attach(
        Role::consumer()
            .with_login(LoginRequest::new("trader"))
            .with_directory(DirectoryRequest::default())
            .with_dictionary_download(DictionaryDownloadMode::FirstAvailable),
    );
    reactor.connect(target(), role).unwrap();
    let server = ScriptedServer::accept(&mut reactor, &listener, WAIT);

    server.recv(&mut reactor, WAIT);
    server.send_rdm(RdmMsg::Login(LoginMsg::Refresh(LoginRefresh::accepted("trader"))));
    server.recv(&mut reactor, WAIT);
    server.send_rdm(RdmMsg::Directory(DirectoryMsg::Refresh(DirectoryRefresh::new(vec![
        ServiceInfo::new(1, "FEED"),
    ]))));

    assert!(pump_until(&mut reactor, WAIT, || log.has(ChannelReady)));
    assert_eq!(
        log.event_types(),
        vec![ChannelOpened, ChannelUp, Warning, ChannelReady]
    );
    let (_, warning) = log.errors().remove(0);
    assert!(warning.text.contains("Dictionary download not supported"));
    assert!(server.try_recv().is_none(), "no dictionary requests expected");
}

#[test]
fn test_no_login_goes_ready_on_up() {
    let network = LoopbackNetwork::new();
    let listener = network.listen("feed", "14002");
    let mut reactor = new_reactor(&network);
    let log = EventLog::new();
    reactor.connect(target(), log.consumer()).unwrap();
    let server = ScriptedServer::accept(&mut reactor, &listener, WAIT);

    assert!(pump_until(&mut reactor, WAIT, || log.has(ChannelReady)));
    assert_eq!(log.event_types(), vec![ChannelOpened, ChannelUp, ChannelReady]);
    assert!(server.try_recv().is_none());
}

#[test]
fn test_login_refused_stays_up() {
    let network = LoopbackNetwork::new();
    let listener = network.listen("feed", "14002");
    let mut reactor = new_reactor(&network);
    let log = EventLog::new();
    let role = log.attach(Role::consumer().with_login(LoginRequest::new("trader")));
    let channel = reactor.connect(target(), role).unwrap();
    let server = ScriptedServer::accept(&mut reactor, &listener, WAIT);
    server.recv(&mut reactor, WAIT);

    let mut refused = LoginRefresh::accepted("trader");
    refused.state = State::closed("not entitled");
    server.send_rdm(RdmMsg::Login(LoginMsg::Refresh(refused)));
    assert!(pump_until(&mut reactor, WAIT, || log.with(|r| r.login_msgs.len() == 1)));
    pump_for(&mut reactor, Duration::from_millis(30));

    assert!(!log.has(ChannelReady));
    assert_eq!(
        reactor.channel_state(channel).unwrap(),
        feedreactor::ChannelState::Up
    );
}

#[test]
fn test_missing_login_callback_falls_through_to_default() {
    let network = LoopbackNetwork::new();
    let listener = network.listen("feed", "14002");
    let mut reactor = new_reactor(&network);

    let events = Arc::new(Mutex::new(Vec::new()));
    let defaults = Arc::new(Mutex::new(Vec::new()));
    let role = Role::consumer()
        .with_login(LoginRequest::new("trader"))
        .on_channel_event({
            let events = events.clone();
            move |_, event| {
                events.lock().push(event.event_type);
                CallbackReturn::Success
            }
        })
        .on_default_msg({
            let defaults = defaults.clone();
            move |_, event| {
                defaults.lock().push(event.msg.clone());
                CallbackReturn::Success
            }
        });
    reactor.connect(target(), role).unwrap();
    let server = ScriptedServer::accept(&mut reactor, &listener, WAIT);
    server.recv(&mut reactor, WAIT);
    server.send_rdm(RdmMsg::Login(LoginMsg::Refresh(LoginRefresh::accepted("trader"))));

    assert!(pump_until(&mut reactor, WAIT, || events.lock().contains(&ChannelReady)));
    let defaults = defaults.lock();
    assert_eq!(defaults.len(), 1);
    assert_eq!(defaults[0].domain, DomainType::Login);
    assert_eq!(defaults[0].msg_class, MsgClass::Refresh);
}

#[test]
fn test_login_callback_raise_reaches_default() {
    let network = LoopbackNetwork::new();
    let listener = network.listen("feed", "14002");
    let mut reactor = new_reactor(&network);
    let log = EventLog::new();
    let role = log
        .attach(Role::consumer().with_login(LoginRequest::new("trader")))
        .on_login_msg(|_, _| CallbackReturn::Raise);
    reactor.connect(target(), role).unwrap();
    let server = ScriptedServer::accept(&mut reactor, &listener, WAIT);
    server.recv(&mut reactor, WAIT);
    server.send_rdm(RdmMsg::Login(LoginMsg::Refresh(LoginRefresh::accepted("trader"))));

    assert!(pump_until(&mut reactor, WAIT, || log.has(ChannelReady)));
    log.with(|r| {
        assert!(r.login_msgs.is_empty());
        assert_eq!(r.default_msgs.len(), 1);
    });
}

#[test]
fn test_rtt_is_echoed_when_enabled() {
    let network = LoopbackNetwork::new();
    let listener = network.listen("feed", "14002");
    let mut reactor = new_reactor(&network);
    let log = EventLog::new();
    let role = log.attach(
        Role::consumer()
            .with_login(LoginRequest::new("trader"))
            .with_rtt(true),
    );
    reactor.connect(target(), role).unwrap();
    let server = ScriptedServer::accept(&mut reactor, &listener, WAIT);

    let login = server.recv(&mut reactor, WAIT);
    assert_eq!(login.body["supports_rtt"], json!(true));
    server.send_rdm(RdmMsg::Login(LoginMsg::Refresh(LoginRefresh::accepted("trader"))));
    assert!(pump_until(&mut reactor, WAIT, || log.has(ChannelReady)));

    server.send_rdm(RdmMsg::Login(LoginMsg::Rtt(LoginRtt {
        stream_id: LOGIN_STREAM_ID,
        ticks: 42,
        last_latency_micros: None,
    })));
    let echo = server.recv(&mut reactor, WAIT);
    assert_eq!(echo.msg_class, MsgClass::Generic);
    assert_eq!(echo.domain, DomainType::Login);
    assert_eq!(echo.body["ticks"], json!(42));
    log.with(|r| {
        assert!(matches!(r.login_msgs.last(), Some(LoginMsg::Rtt(rtt)) if rtt.ticks == 42));
    });
}

#[test]
fn test_rtt_is_dropped_when_disabled() {
    let network = LoopbackNetwork::new();
    let listener = network.listen("feed", "14002");
    let mut reactor = new_reactor(&network);
    let log = EventLog::new();
    let role = log.attach(Role::consumer().with_login(LoginRequest::new("trader")));
    reactor.connect(target(), role).unwrap();
    let server = ScriptedServer::accept(&mut reactor, &listener, WAIT);
    server.recv(&mut reactor, WAIT);
    server.send_rdm(RdmMsg::Login(LoginMsg::Refresh(LoginRefresh::accepted("trader"))));
    assert!(pump_until(&mut reactor, WAIT, || log.has(ChannelReady)));

    server.send_rdm(RdmMsg::Login(LoginMsg::Rtt(LoginRtt {
        stream_id: LOGIN_STREAM_ID,
        ticks: 7,
        last_latency_micros: None,
    })));
    pump_for(&mut reactor, Duration::from_millis(50));
    assert!(server.try_recv().is_none());
    log.with(|r| {
        assert_eq!(r.login_msgs.len(), 1);
        assert!(r.default_msgs.is_empty());
    });
}

#[test]
fn test_provider_serves_consumer_in_same_reactor() {
    verbose_println!("Testing consumer and provider channels on one reactor...");

    let network = LoopbackNetwork::new();
    let listener = network.listen("feed", "14002");
    let mut reactor = new_reactor(&network);

    let consumer_log = EventLog::new();
    let consumer = consumer_log.attach(
        Role::consumer()
            .with_login(LoginRequest::new("trader"))
            .with_directory(DirectoryRequest::default()),
    );

    // Provider answers session requests from its default callback
    let provider = Role::provider()
        .on_channel_event(|_, event| {
            verbose_println!("  provider event {}", event.event_type);
            CallbackReturn::Success
        })
        .on_default_msg(|ctx, event| {
            let reply = match (event.msg.domain, event.msg.msg_class) {
                (DomainType::Login, MsgClass::Request) => Some(RdmMsg::Login(LoginMsg::Refresh(
                    LoginRefresh::accepted("trader"),
                ))),
                (DomainType::Source, MsgClass::Request) => Some(RdmMsg::Directory(
                    DirectoryMsg::Refresh(DirectoryRefresh::new(vec![ServiceInfo::new(3, "FEED")])),
                )),
                (DomainType::MarketPrice, MsgClass::Request) => {
                    let refresh = Msg::new(MsgClass::Refresh, DomainType::MarketPrice, event.msg.stream_id)
                        .with_body(ContainerType::FieldList, json!({"BID": 99.5}))
                        .with_service(event.msg.service_id.unwrap_or_default());
                    return match ctx.submit(Payload::Msg(refresh), &SubmitOptions::default()) {
                        Ok(_) => CallbackReturn::Success,
                        Err(_) => CallbackReturn::Failure,
                    };
                }
                _ => None,
            };
            if let Some(reply) = reply {
                if ctx.submit(Payload::Rdm(reply), &SubmitOptions::default()).is_err() {
                    return CallbackReturn::Failure;
                }
            }
            CallbackReturn::Success
        });

    let client = reactor
        .connect(ConnectOptions::single(ConnectionTarget::new("feed", "14002")), consumer)
        .unwrap();
    let server = reactor
        .accept(&listener, AcceptOptions::default(), provider)
        .unwrap();

    assert!(pump_until(&mut reactor, WAIT, || consumer_log.has(ChannelReady)));
    assert_eq!(
        reactor.channel_state(server).unwrap(),
        feedreactor::ChannelState::Ready
    );

    let request = Msg::new(MsgClass::Request, DomainType::MarketPrice, 5)
        .with_body(ContainerType::ElementList, json!({"name": "EUR="}));
    reactor
        .submit(client, Payload::Msg(request), &SubmitOptions::for_service("FEED"))
        .unwrap();
    assert!(pump_until(&mut reactor, WAIT, || {
        consumer_log.with(|r| !r.default_msgs.is_empty())
    }));
    consumer_log.with(|r| {
        let refresh = &r.default_msgs[0];
        assert_eq!(refresh.stream_id, 5);
        assert_eq!(refresh.service_id, Some(3));
        assert_eq!(refresh.body["BID"], json!(99.5));
    });
}
