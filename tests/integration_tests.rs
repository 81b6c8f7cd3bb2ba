//! Integration tests for the networked object layer
//!
//! A real server and real client sessions talk over loopback TCP, each side
//! driven by its own tick loop the way the binaries drive them.

use assert_approx_eq::assert_approx_eq;
use client::{ClientGame, ClientSession, SessionError, SessionState};
use server::{Arena, GameState, NetworkServer};
use shared::avatar::{avatar_template, demo_templates, Avatar, MOVE_REQUEST};
use shared::{ClientId, NetworkConfig, ObjectId, Owner};
use std::time::{Duration, Instant};
use tokio::time::sleep;

type Session = ClientSession<ClientGame>;

const DT: f32 = 1.0 / 30.0;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn start_server() -> NetworkServer<Arena> {
    init_logging();
    let templates = demo_templates();
    let avatar = avatar_template(&templates).unwrap();
    NetworkServer::bind(
        "127.0.0.1:0",
        NetworkConfig::default(),
        templates,
        Arena::new(avatar),
    )
    .await
    .unwrap()
}

fn new_session() -> Session {
    ClientSession::new(NetworkConfig::default(), demo_templates(), ClientGame::new())
}

/// Connects while ticking the server, which hands out ids during its tick
async fn connect(server: &mut NetworkServer<Arena>, session: &mut Session) -> Result<ClientId, SessionError> {
    let addr = server.local_addr().to_string();
    let connecting = session.connect(&addr);
    tokio::pin!(connecting);

    loop {
        tokio::select! {
            result = &mut connecting => return result,
            _ = sleep(Duration::from_millis(5)) => {
                server.tick().await;
            }
        }
    }
}

/// One tick of the server followed by one tick of every session
async fn round(server: &mut NetworkServer<Arena>, sessions: &mut [Session]) {
    server.tick().await;
    server.with_context(|arena, ctx| arena.step(ctx, DT));
    server.broadcast_updates();
    for session in sessions.iter_mut() {
        session.process_tick().await;
    }
    sleep(Duration::from_millis(5)).await;
}

/// Runs rounds until `condition` holds
async fn run_until<F>(server: &mut NetworkServer<Arena>, sessions: &mut [Session], condition: F)
where
    F: Fn(&NetworkServer<Arena>, &[Session]) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition(server, sessions) {
        assert!(Instant::now() < deadline, "world did not reach the expected state");
        round(server, sessions).await;
    }
}

fn own_avatar(session: &Session) -> Option<(ObjectId, &Avatar)> {
    session.listener().own_avatar(session.directory())
}

/// Connects `players` sessions, starts the game and waits until every
/// session sees every avatar
async fn loaded_game(players: usize) -> (NetworkServer<Arena>, Vec<Session>) {
    let mut server = start_server().await;
    let mut sessions: Vec<Session> = (0..players).map(|_| new_session()).collect();
    for session in sessions.iter_mut() {
        connect(&mut server, session).await.unwrap();
    }

    run_until(&mut server, &mut sessions, |server, _| server.player_count() == players).await;
    server.start_game().unwrap();
    run_until(&mut server, &mut sessions, |_, sessions| {
        sessions.iter().all(|s| s.state() == SessionState::Loading)
    })
    .await;

    for session in sessions.iter_mut() {
        session.notify_loaded().unwrap();
    }
    run_until(&mut server, &mut sessions, |_, sessions| {
        sessions.iter().all(|s| {
            s.directory().len() == players
                && s.directory().ids().all(|id| s.directory().is_synchronized(id))
        })
    })
    .await;

    (server, sessions)
}

/// CONNECTION LIFECYCLE TESTS
mod lifecycle_tests {
    use super::*;

    /// Clients receive distinct ids and the server counts them
    #[tokio::test]
    async fn clients_join_the_lobby() {
        let mut server = start_server().await;
        let mut sessions = vec![new_session(), new_session(), new_session()];

        let mut ids = Vec::new();
        for session in sessions.iter_mut() {
            ids.push(connect(&mut server, session).await.unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);

        run_until(&mut server, &mut sessions, |server, sessions| {
            server.player_count() == 3 && sessions.iter().all(|s| s.player_count() == 3)
        })
        .await;

        assert_eq!(server.state(), GameState::Lobby);
        assert!(sessions.iter().all(|s| s.state() == SessionState::Connected));
        server.shutdown().await;
    }

    /// Sockets arriving after the game started never receive an id
    #[tokio::test]
    async fn late_client_is_turned_away() {
        let (mut server, _sessions) = loaded_game(1).await;

        let mut late = new_session();
        let result = connect(&mut server, &mut late).await;

        assert!(matches!(result, Err(SessionError::Handshake(_))));
        assert_eq!(late.state(), SessionState::Disconnected);
        assert_eq!(server.player_count(), 1);
        server.shutdown().await;
    }

    /// Server shutdown says goodbye, so clients do not treat it as an error
    #[tokio::test]
    async fn shutdown_disconnects_clients() {
        let (mut server, mut sessions) = loaded_game(2).await;

        server.shutdown().await;
        assert_eq!(server.registry().live_connections(), 0);

        let deadline = Instant::now() + Duration::from_secs(10);
        while sessions.iter().any(|s| s.state() != SessionState::Disconnected) {
            assert!(Instant::now() < deadline, "clients never noticed the shutdown");
            for session in sessions.iter_mut() {
                session.process_tick().await;
            }
            sleep(Duration::from_millis(5)).await;
        }

        for session in &sessions {
            assert!(session.listener().is_disconnected());
            assert!(session.directory().is_empty());
        }
    }
}

/// REPLICATION TESTS
mod replication_tests {
    use super::*;

    /// A loaded client sees its own avatar and the server clock
    #[tokio::test]
    async fn avatar_replicates_to_its_owner() {
        let (mut server, sessions) = loaded_game(1).await;
        let session = &sessions[0];

        let (object, avatar) = own_avatar(session).unwrap();
        let authoritative = server.directory().get_as::<Avatar>(object).unwrap();
        assert_approx_eq!(avatar.state.x, authoritative.state.x);
        assert_approx_eq!(avatar.state.y, authoritative.state.y);
        assert!(session.owns(object));
        assert!(session.server_time() > 0.0);
        assert_eq!(session.player_count(), 1);

        server.shutdown().await;
    }

    /// Move requests change the authoritative avatar and flow back to the client
    #[tokio::test]
    async fn move_requests_round_trip() {
        let (mut server, mut sessions) = loaded_game(1).await;
        let (object, avatar) = own_avatar(&sessions[0]).unwrap();
        let start_x = avatar.state.x;

        let request = sessions[0].listener_mut().next_move(false, true, false);
        sessions[0]
            .request(object, MOVE_REQUEST, request.encode().unwrap())
            .unwrap();

        run_until(&mut server, &mut sessions, |_, sessions| {
            own_avatar(&sessions[0]).map_or(false, |(_, a)| a.state.x > start_x + 1.0)
        })
        .await;
        server.shutdown().await;
    }

    /// Other clients see the avatar move and hear about the jump
    #[tokio::test]
    async fn jumps_are_broadcast_to_everyone() {
        let (mut server, mut sessions) = loaded_game(2).await;
        let (jumper, _) = own_avatar(&sessions[0]).unwrap();
        assert!(!sessions[1].owns(jumper));

        let request = sessions[0].listener_mut().next_move(false, false, true);
        sessions[0]
            .request(jumper, MOVE_REQUEST, request.encode().unwrap())
            .unwrap();

        run_until(&mut server, &mut sessions, |_, sessions| {
            sessions.iter().all(|s| s.listener().jumps_seen() == 1)
        })
        .await;
        server.shutdown().await;
    }

    /// Requests for someone else's avatar are ignored by the server
    #[tokio::test]
    async fn foreign_requests_are_ignored() {
        let (mut server, mut sessions) = loaded_game(2).await;
        let (victim, avatar) = own_avatar(&sessions[1]).unwrap();
        let start_x = avatar.state.x;

        let request = sessions[0].listener_mut().next_move(true, false, true);
        sessions[0]
            .request(victim, MOVE_REQUEST, request.encode().unwrap())
            .unwrap();

        // Let the request arrive and a few replication rounds pass
        for _ in 0..20 {
            round(&mut server, &mut sessions).await;
        }

        let authoritative = server.directory().get_as::<Avatar>(victim).unwrap();
        assert_approx_eq!(authoritative.state.x, start_x);
        assert!(sessions.iter().all(|s| s.listener().jumps_seen() == 0));
        server.shutdown().await;
    }

    /// A departing player's avatar stays, owned by the server
    #[tokio::test]
    async fn departed_avatar_passes_to_server() {
        let (mut server, mut sessions) = loaded_game(2).await;
        let (departed, _) = own_avatar(&sessions[0]).unwrap();

        sessions[0].dispose().await;
        assert!(sessions[0].listener().is_disconnected());

        run_until(&mut server, &mut sessions, |server, sessions| {
            server.player_count() == 1
                && sessions[1].directory().owner(departed) == Some(Owner::Server)
        })
        .await;

        assert_eq!(server.directory().owner(departed), Some(Owner::Server));
        assert_eq!(sessions[1].directory().len(), 2);
        server.shutdown().await;
    }
}
