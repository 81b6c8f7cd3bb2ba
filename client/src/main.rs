use clap::Parser;
use client::game::scripted_input;
use client::{ClientGame, ClientSession, SessionState};
use log::{debug, info};
use shared::avatar::{demo_templates, MOVE_REQUEST};
use shared::NetworkConfig;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Tick rate (updates per second)
    #[arg(short = 't', long, default_value = "30")]
    tick_rate: u32,

    /// Seconds to wait for the server to accept the connection
    #[arg(long, default_value = "5")]
    connect_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {}", args.server);

    let config = NetworkConfig::default()
        .with_connect_timeout(Duration::from_secs(args.connect_timeout));
    let mut session = ClientSession::new(config, demo_templates(), ClientGame::new());
    session.connect(&args.server).await?;

    let dt = 1.0 / args.tick_rate.max(1) as f32;
    let mut ticker = interval(Duration::from_secs_f32(dt));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                session.process_tick().await;
                if session.state() == SessionState::Disconnected {
                    break;
                }

                if session.state() == SessionState::Loading {
                    session.notify_loaded()?;
                    info!("Loaded, waiting for my avatar...");
                }

                if session.state() == SessionState::InGame {
                    tick += 1;
                    let (left, right, jump) = scripted_input(tick);
                    let request = session.listener_mut().next_move(left, right, jump);

                    let own = session.listener().own_avatar(session.directory()).map(|(id, _)| id);
                    if let Some(object) = own {
                        session.request(object, MOVE_REQUEST, request.encode()?)?;
                        session.with_listener(|game, directory| {
                            if let Some(avatar) = game.predict(directory, &request, dt) {
                                debug!("Predicted position ({:.1}, {:.1})", avatar.state.x, avatar.state.y);
                            }
                        });
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, disconnecting...");
                break;
            }
        }
    }

    session.dispose().await;
    info!("Saw {} jumps this session", session.listener().jumps_seen());
    Ok(())
}
