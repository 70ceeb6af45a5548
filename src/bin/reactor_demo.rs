//! Consumer and provider on one reactor, talking over the loopback transport
//!
//! The consumer logs in, reads the source directory, subscribes to a few
//! items and prints the prices the provider publishes.
//!
//! Configuration comes from `--config <path>`, then `REACTOR_CONFIG_PATH`
//! (default `config/reactor.yaml`), when that file exists.

use anyhow::Result;
use feedreactor::rdm::{
    DirectoryMsg, DirectoryRefresh, DirectoryRequest, LoginMsg, LoginRefresh, LoginRequest, RdmMsg,
    ServiceInfo,
};
use feedreactor::{
    AcceptOptions, CallbackContext, CallbackReturn, ChannelEventType, ConnectOptions,
    ConnectionTarget, ContainerType, DomainType, JsonFrameCodec, LoopbackNetwork, Msg, MsgClass,
    MsgEvent, Payload, Reactor, ReactorConfig, Role, SubmitOptions,
};
use market_feed_reactor::bin_common::{
    init_tracing, load_reactor_config, parse_args, resolve_config_path, run_dispatch_loop,
    ConfigType, RunConfig,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const SERVICE_NAME: &str = "DEMO_FEED";
const SERVICE_ID: u16 = 1;
const ITEMS: [&str; 3] = ["EUR=", "JPY=", "GBP="];

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing("info");

    let config = load_config()?;
    let network = LoopbackNetwork::new();
    let endpoint = config
        .connect
        .connection_list
        .first()
        .cloned()
        .unwrap_or_else(|| ConnectionTarget::new("localhost", "14002"));
    let listener = network.listen(&endpoint.address, &endpoint.port);

    let mut reactor = Reactor::new(
        config.reactor.clone(),
        Arc::new(network.clone()),
        Arc::new(JsonFrameCodec::new()),
    )?;

    let prices = Arc::new(Mutex::new(0u64));
    let consumer = reactor.connect(config.connect.clone(), consumer_role(prices.clone()))?;
    info!("Consumer channel {} opened", consumer);

    // Wait for the consumer's connection to reach the listener
    let deadline = Instant::now() + Duration::from_secs(5);
    while listener.pending() == 0 {
        if Instant::now() >= deadline {
            anyhow::bail!("consumer never reached {}", listener.endpoint());
        }
        reactor.dispatch(&config.dispatch.with_timeout(Duration::from_millis(10)))?;
    }
    let provider = reactor.accept(&listener, AcceptOptions::default(), provider_role())?;
    info!("Provider channel {} accepted", provider);

    let run = RunConfig::new("Reactor demo")
        .with_heartbeat(5)
        .with_run_for(Duration::from_secs(10))
        .with_dispatch(config.dispatch.with_timeout(Duration::from_millis(100)));
    let summary = run_dispatch_loop(&mut reactor, &run, |_| *prices.lock() >= 3 * ITEMS.len() as u64)?;

    info!(
        "Received {} price messages in {:?}",
        *prices.lock(),
        summary.elapsed
    );
    reactor.shutdown()?;
    Ok(())
}

fn load_config() -> Result<ReactorConfig> {
    let path = resolve_config_path(&parse_args(), ConfigType::Reactor)?;
    if path.exists() {
        return load_reactor_config(&path);
    }
    info!("No config at {}, using loopback defaults", path.display());
    Ok(ReactorConfig {
        reactor: Default::default(),
        connect: ConnectOptions::single(ConnectionTarget::new("localhost", "14002"))
            .with_reconnect(3, 500, 3000),
        dispatch: Default::default(),
    })
}

fn consumer_role(prices: Arc<Mutex<u64>>) -> Role {
    Role::consumer()
        .with_login(LoginRequest::new("demo"))
        .with_directory(DirectoryRequest::default())
        .on_channel_event(|ctx, event| {
            info!("Consumer event {} on channel {}", event.event_type, event.channel);
            if let Some(error) = &event.error {
                warn!("  {:?} at {}: {}", error.code, error.location, error.text);
            }
            if event.event_type == ChannelEventType::ChannelReady {
                return subscribe(ctx);
            }
            CallbackReturn::Success
        })
        .on_default_msg(move |_, event| {
            let msg = &event.msg;
            if msg.domain != DomainType::MarketPrice {
                return CallbackReturn::Success;
            }
            info!(
                "Consumer {:?} stream {}: {}",
                msg.msg_class, msg.stream_id, msg.body
            );
            *prices.lock() += 1;
            CallbackReturn::Success
        })
}

fn subscribe(ctx: &mut CallbackContext<'_>) -> CallbackReturn {
    // Reconnections replay open requests by themselves
    if ctx.channel_info().map_or(false, |info| info.open_subscriptions > 0) {
        return CallbackReturn::Success;
    }
    for (offset, item) in ITEMS.iter().enumerate() {
        let request = Msg::new(MsgClass::Request, DomainType::MarketPrice, 5 + offset as i32)
            .with_body(ContainerType::ElementList, json!({ "name": item }));
        if let Err(e) = ctx.submit(Payload::Msg(request), &SubmitOptions::for_service(SERVICE_NAME)) {
            warn!("Request for {} failed: {}", item, e);
        }
    }
    CallbackReturn::Success
}

fn provider_role() -> Role {
    Role::provider()
        .on_channel_event(|_, event| {
            info!("Provider event {} on channel {}", event.event_type, event.channel);
            CallbackReturn::Success
        })
        .on_default_msg(answer_request)
}

/// Login and directory requests get a refresh; item requests get a refresh
/// followed by two updates
fn answer_request(ctx: &mut CallbackContext<'_>, event: &MsgEvent) -> CallbackReturn {
    let msg = &event.msg;
    if msg.msg_class != MsgClass::Request {
        return CallbackReturn::Success;
    }
    let replies: Vec<Payload> = match msg.domain {
        DomainType::Login => vec![RdmMsg::Login(LoginMsg::Refresh(LoginRefresh::accepted("demo"))).into()],
        DomainType::Source => vec![RdmMsg::Directory(DirectoryMsg::Refresh(DirectoryRefresh::new(
            vec![ServiceInfo::new(SERVICE_ID, SERVICE_NAME)],
        )))
        .into()],
        DomainType::MarketPrice => {
            let name = msg.body["name"].as_str().unwrap_or("?").to_string();
            let mut replies = vec![Msg::new(MsgClass::Refresh, DomainType::MarketPrice, msg.stream_id)
                .with_service(SERVICE_ID)
                .with_body(
                    ContainerType::FieldList,
                    json!({ "name": name, "BID": 100.0, "ASK": 100.5 }),
                )
                .into()];
            for tick in 1..=2 {
                replies.push(
                    Msg::new(MsgClass::Update, DomainType::MarketPrice, msg.stream_id)
                        .with_service(SERVICE_ID)
                        .with_body(
                            ContainerType::FieldList,
                            json!({ "BID": 100.0 + tick as f64 / 10.0 }),
                        )
                        .into(),
                );
            }
            replies
        }
        _ => Vec::new(),
    };

    for reply in replies {
        if let Err(e) = ctx.submit(reply, &SubmitOptions::default()) {
            warn!("Provider reply failed: {}", e);
            return CallbackReturn::Failure;
        }
    }
    CallbackReturn::Success
}
