//! Chat server example with group broadcast
//!
//! Run with: cargo run --example chat_server [BIND_ADDR]
//!
//! Examples:
//!   cargo run --example chat_server                    # binds to 0.0.0.0:7070
//!   cargo run --example chat_server localhost          # binds to 127.0.0.1:7070
//!   cargo run --example chat_server 127.0.0.1:7071     # binds to 127.0.0.1:7071
//!
//! ## Methods
//!
//!   1  join(room: String, nick: String) -> u32   members in the room
//!   2  leave() -> bool
//!   3  say(text: String)                          fire-and-forget is fine
//!   4  members() -> u32
//!
//! ## Receiver calls
//!
//!   100  on_joined(nick: String)
//!   101  on_left(nick: String)
//!   102  on_message(nick: String, text: String)
//!
//! Set `REDIS_URL` to relay rooms across several server processes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use hubcast::group::{DistributedGroupFactory, GroupConfig, GroupRepositoryFactory, InMemoryGroupFactory};
use hubcast::hub::{HubFilter, InvokeContext, MethodTable, Next, StreamingHub};
use hubcast::{HubContext, HubServer, ServerConfig, Status};

const ON_JOINED: i32 = 100;
const ON_LEFT: i32 = 101;
const ON_MESSAGE: i32 = 102;

/// One instance per connection
#[derive(Default)]
struct ChatHub {
    nick: Option<String>,
    room: Option<String>,
}

impl StreamingHub for ChatHub {
    async fn on_connected(&mut self, ctx: &HubContext) {
        println!("[{}] Connected from {:?}", ctx.connection_id(), ctx.peer_addr());
    }

    async fn on_disconnected(&mut self, ctx: &HubContext) {
        // Still a member here; groups are left after this hook
        if let (Some(room), Some(nick)) = (self.room.take(), self.nick.take()) {
            if let Some(group) = ctx.groups().get(&room) {
                if let Ok(message) = ctx.message(ON_LEFT, &nick) {
                    group.broadcast_except_self(ctx.connection_id(), &message).await;
                }
            }
        }
        println!("[{}] Disconnected after {:?}", ctx.connection_id(), ctx.connected_for());
    }

    fn method_table() -> MethodTable<Self> {
        MethodTable::new()
            .register(1, "join", join)
            .register(2, "leave", leave)
            .register(3, "say", say)
            .register(4, "members", members)
    }
}

fn join<'a>(hub: &'a mut ChatHub, ctx: HubContext, args: Bytes) -> BoxFuture<'a, Result<Bytes, Status>> {
    Box::pin(async move {
        let (room, nick): (String, String) = ctx.decode(&args)?;
        if hub.room.is_some() {
            return Err(Status::invalid_argument("already in a room"));
        }

        let group = ctx.groups().join(&room).await?;
        group.broadcast_except_self(ctx.connection_id(), &ctx.message(ON_JOINED, &nick)?).await;

        let count = group.member_count().await as u32;
        println!("[{}] {} joined '{}' ({} members)", ctx.connection_id(), nick, room, count);
        hub.room = Some(room);
        hub.nick = Some(nick);
        ctx.encode(&count)
    })
}

fn leave<'a>(hub: &'a mut ChatHub, ctx: HubContext, _args: Bytes) -> BoxFuture<'a, Result<Bytes, Status>> {
    Box::pin(async move {
        let Some(room) = hub.room.take() else {
            return ctx.encode(&false);
        };
        let nick = hub.nick.take().unwrap_or_default();

        if let Some(group) = ctx.groups().get(&room) {
            group.broadcast_except_self(ctx.connection_id(), &ctx.message(ON_LEFT, &nick)?).await;
        }
        let left = ctx.groups().leave(&room).await;
        ctx.encode(&left)
    })
}

fn say<'a>(hub: &'a mut ChatHub, ctx: HubContext, args: Bytes) -> BoxFuture<'a, Result<Bytes, Status>> {
    Box::pin(async move {
        let text: String = ctx.decode(&args)?;
        let (Some(room), Some(nick)) = (hub.room.as_deref(), hub.nick.as_deref()) else {
            return Err(Status::invalid_argument("join a room first"));
        };
        let group = ctx
            .groups()
            .get(room)
            .ok_or_else(|| Status::not_found(format!("room '{}' is gone", room)))?;

        let report = group.broadcast_all(&ctx.message(ON_MESSAGE, &(nick, text.as_str()))?).await;
        tracing::debug!(room, delivered = report.delivered, failed = report.failed, "Message sent");
        ctx.encode(&())
    })
}

fn members<'a>(hub: &'a mut ChatHub, ctx: HubContext, _args: Bytes) -> BoxFuture<'a, Result<Bytes, Status>> {
    Box::pin(async move {
        let count = match hub.room.as_deref().and_then(|room| ctx.groups().get(room)) {
            Some(group) => group.member_count().await as u32,
            None => 0,
        };
        ctx.encode(&count)
    })
}

/// Logs slow calls
struct SlowCallLog {
    threshold: Duration,
}

#[async_trait::async_trait]
impl HubFilter for SlowCallLog {
    async fn invoke(&self, ctx: &mut InvokeContext, next: Next<'_>) -> Result<Bytes, Status> {
        let result = next.run(ctx).await;
        let elapsed = ctx.started_at.elapsed();
        if elapsed > self.threshold {
            tracing::warn!(method = ctx.method_name, elapsed_ms = elapsed.as_millis() as u64, "Slow call");
        }
        result
    }
}

/// Parse bind address from command line argument.
///
/// Accepts formats:
/// - "localhost" -> 127.0.0.1:7070
/// - "127.0.0.1" -> 127.0.0.1:7070
/// - "127.0.0.1:7071" -> 127.0.0.1:7071
fn parse_bind_addr(arg: &str) -> Result<SocketAddr, String> {
    let normalized = arg.replace("localhost", "127.0.0.1");

    if let Ok(addr) = normalized.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = normalized.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, hubcast::server::config::DEFAULT_PORT));
    }

    Err(format!(
        "Invalid bind address: '{}'. Expected format: IP:PORT or IP or 'localhost'",
        arg
    ))
}

fn print_usage() {
    eprintln!("Usage: chat_server [BIND_ADDR]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  BIND_ADDR    Address to bind to (default: 0.0.0.0:7070)");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  REDIS_URL    Relay rooms through Redis, e.g. redis://127.0.0.1/");
}

async fn group_factory() -> Result<Box<dyn GroupRepositoryFactory>, Box<dyn std::error::Error>> {
    let config = GroupConfig::default();
    match std::env::var("REDIS_URL") {
        Ok(url) => {
            let backplane = hubcast::RedisBackplane::connect(&url).await?;
            println!("Relaying rooms through {}", url);
            Ok(Box::new(DistributedGroupFactory::new(config, Arc::new(backplane))))
        }
        Err(_) => Ok(Box::new(InMemoryGroupFactory::new(config))),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let mut config = ServerConfig::default().heartbeat(Duration::from_secs(15), Duration::from_secs(10));
    if let Some(addr_str) = args.get(1) {
        match parse_bind_addr(addr_str) {
            Ok(addr) => config = config.bind(addr),
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        }
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hubcast=debug".parse()?)
                .add_directive("chat_server=debug".parse()?),
        )
        .init();

    println!("Starting chat server on {}", config.bind_addr);

    let factory = group_factory().await?;
    let server = HubServer::with_group_factory(config, ChatHub::default, factory.as_ref()).with_filter(SlowCallLog {
        threshold: Duration::from_millis(250),
    });
    let server = Arc::new(server);

    let stats_server = Arc::clone(&server);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            let stats = stats_server.stats();
            println!(
                "Stats: sessions={} rooms={} calls={} broadcasts={} deliveries={} failures={:.2}%",
                stats.active_connections,
                stats_server.repository().len(),
                stats.invocations,
                stats.broadcasts,
                stats.deliveries,
                stats.delivery_failure_rate() * 100.0,
            );
        }
    });

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            println!("\nShutting down...");
        })
        .await?;

    Ok(())
}
