use clap::Parser;
use log::{info, warn};
use server::{Arena, GameState, NetworkServer};
use shared::avatar::{avatar_template, demo_templates};
use shared::NetworkConfig;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Tick rate (updates per second)
    #[clap(short, long, default_value = "30")]
    tick_rate: u32,
    /// Maximum simultaneous connections
    #[clap(short, long, default_value = "16")]
    max_clients: usize,
    /// Start the game once this many players are connected (0 = stay in the lobby)
    #[clap(long, default_value = "2")]
    min_players: usize,
}

/// Parses command-line arguments, binds the server and runs the tick loop until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = NetworkConfig::default().with_max_clients(args.max_clients);
    let templates = demo_templates();
    let avatar = avatar_template(&templates).ok_or("avatar template not registered")?;

    let address = format!("{}:{}", args.host, args.port);
    let mut server = NetworkServer::bind(&address, config, templates, Arena::new(avatar)).await?;

    let mut interval_timer = interval(Duration::from_secs_f32(1.0 / args.tick_rate.max(1) as f32));
    interval_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last_update = Instant::now();
    // Cap the maximum delta time to 50ms
    let max_delta_time = 1.0 / 20.0;

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                let now = Instant::now();
                let mut delta_time = (now - last_update).as_secs_f32();
                last_update = now;
                if delta_time > max_delta_time {
                    warn!("Large delta time detected ({:.3}s), capping to {:.3}s", delta_time, max_delta_time);
                    delta_time = max_delta_time;
                }

                server.tick().await;

                if server.state() == GameState::Lobby
                    && args.min_players > 0
                    && server.player_count() >= args.min_players
                {
                    server.start_game()?;
                }

                server.with_context(|arena, ctx| arena.step(ctx, delta_time));
                server.broadcast_updates();
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
        }
    }

    server.shutdown().await;
    Ok(())
}
