use crate::network::{Recipients, ServerContext, ServerListener};
use log::{debug, info, warn};
use shared::avatar::{
    resolve_collision, Avatar, MoveRequest, AVATAR_SIZE, FLOOR_Y, JUMPED_EVENT, MOVE_REQUEST,
    WORLD_WIDTH,
};
use shared::{ClientId, ObjectId, Owner, RequestId, TemplateId};
use std::collections::HashMap;

/// Demo game mode: every loaded client drives one avatar
#[derive(Debug)]
pub struct Arena {
    avatar_template: TemplateId,
    avatars: HashMap<ClientId, ObjectId>,
    last_sequence: HashMap<ClientId, u32>,
}

impl Arena {
    pub fn new(avatar_template: TemplateId) -> Self {
        Self {
            avatar_template,
            avatars: HashMap::new(),
            last_sequence: HashMap::new(),
        }
    }

    pub fn avatar_of(&self, client: ClientId) -> Option<ObjectId> {
        self.avatars.get(&client).copied()
    }

    /// Advances every avatar and separates overlapping ones
    pub fn step(&mut self, ctx: &mut ServerContext<'_>, dt: f32) {
        let directory = ctx.directory_mut();
        let mut ids = Vec::new();
        for (id, avatar) in directory.iter_as_mut::<Avatar>() {
            avatar.step(dt);
            ids.push(id);
        }

        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                let (Some(mut a), Some(mut b)) = (
                    directory.get_as::<Avatar>(ids[i]).cloned(),
                    directory.get_as::<Avatar>(ids[j]).cloned(),
                ) else {
                    continue;
                };

                resolve_collision(&mut a, &mut b);

                if let Some(slot) = directory.get_as_mut::<Avatar>(ids[i]) {
                    *slot = a;
                }
                if let Some(slot) = directory.get_as_mut::<Avatar>(ids[j]) {
                    *slot = b;
                }
            }
        }
    }

    fn handle_move(&mut self, ctx: &mut ServerContext<'_>, client: ClientId, object: ObjectId, body: &[u8]) {
        let request = match MoveRequest::decode(body) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed move request from client {}: {}", client, e);
                return;
            }
        };

        let last = self.last_sequence.entry(client).or_insert(0);
        if request.sequence <= *last {
            debug!("Ignoring stale move {} from client {}", request.sequence, client);
            return;
        }
        *last = request.sequence;

        let jumped = match ctx.directory_mut().get_as_mut::<Avatar>(object) {
            Some(avatar) => avatar.apply_move(&request),
            None => return,
        };
        if jumped {
            if let Err(e) = ctx.send_event(object, JUMPED_EVENT, Vec::new(), Recipients::Loaded) {
                warn!("Failed to announce jump of object {}: {}", object, e);
            }
        }
    }
}

impl ServerListener for Arena {
    fn client_fully_connected(&mut self, ctx: &mut ServerContext<'_>, client: ClientId) {
        info!("Client {} joined, {} players connected", client, ctx.player_count());
    }

    fn client_loaded(&mut self, ctx: &mut ServerContext<'_>, client: ClientId) {
        if self.avatars.contains_key(&client) {
            return;
        }

        let object = match ctx.spawn_object(Owner::Client(client), self.avatar_template) {
            Ok(object) => object,
            Err(e) => {
                warn!("Could not spawn avatar for client {}: {}", client, e);
                return;
            }
        };

        let spawn_x = 100.0 + (client.0 as f32 * 60.0) % (WORLD_WIDTH - 200.0);
        if let Some(avatar) = ctx.directory_mut().get_as_mut::<Avatar>(object) {
            *avatar = Avatar::new(spawn_x, FLOOR_Y - AVATAR_SIZE);
        }
        info!("Spawned avatar {} for client {} at x={}", object, client, spawn_x);
        self.avatars.insert(client, object);
    }

    fn client_disconnected(&mut self, ctx: &mut ServerContext<'_>, client: ClientId) {
        self.last_sequence.remove(&client);
        let Some(object) = self.avatars.remove(&client) else {
            return;
        };

        // The avatar stays in the world as a server-owned, idle object.
        if let Some(avatar) = ctx.directory_mut().get_as_mut::<Avatar>(object) {
            avatar.apply_move(&MoveRequest {
                sequence: 0,
                left: false,
                right: false,
                jump: false,
            });
        }
        if let Err(e) = ctx.directory_mut().set_owner(object, Owner::Server) {
            warn!("Could not release avatar {}: {}", object, e);
        }
        info!("Client {} left, avatar {} released", client, object);
    }

    fn client_component_request(
        &mut self,
        ctx: &mut ServerContext<'_>,
        client: ClientId,
        object: ObjectId,
        request: RequestId,
        body: &[u8],
    ) {
        if request == MOVE_REQUEST {
            self.handle_move(ctx, client, object, body);
        } else {
            debug!("Unknown request {:?} from client {}", request, client);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkServer;
    use assert_approx_eq::assert_approx_eq;
    use shared::avatar::{demo_templates, AVATAR_SPEED};
    use shared::NetworkConfig;

    async fn arena_server() -> NetworkServer<Arena> {
        NetworkServer::bind(
            "127.0.0.1:0",
            NetworkConfig::default(),
            demo_templates(),
            Arena::new(TemplateId(0)),
        )
        .await
        .unwrap()
    }

    fn move_body(sequence: u32, right: bool, jump: bool) -> Vec<u8> {
        MoveRequest {
            sequence,
            left: false,
            right,
            jump,
        }
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn loading_spawns_one_owned_avatar() {
        let mut server = arena_server().await;
        let client = ClientId(0);

        server.with_context(|arena, ctx| arena.client_loaded(ctx, client));
        server.with_context(|arena, ctx| arena.client_loaded(ctx, client));

        let object = server.listener().avatar_of(client).unwrap();
        assert_eq!(server.directory().len(), 1);
        assert_eq!(server.directory().owner(object), Some(Owner::Client(client)));
        let avatar = server.directory().get_as::<Avatar>(object).unwrap();
        assert_approx_eq!(avatar.state.y, FLOOR_Y - AVATAR_SIZE);
    }

    #[tokio::test]
    async fn moves_apply_in_sequence_order_only() {
        let mut server = arena_server().await;
        let client = ClientId(3);
        server.with_context(|arena, ctx| arena.client_loaded(ctx, client));
        let object = server.listener().avatar_of(client).unwrap();

        let body = move_body(2, true, false);
        server.with_context(|arena, ctx| {
            arena.client_component_request(ctx, client, object, MOVE_REQUEST, &body)
        });
        let stale = move_body(1, false, false);
        server.with_context(|arena, ctx| {
            arena.client_component_request(ctx, client, object, MOVE_REQUEST, &stale)
        });

        let avatar = server.directory().get_as::<Avatar>(object).unwrap();
        assert_approx_eq!(avatar.state.vel_x, AVATAR_SPEED);
    }

    #[tokio::test]
    async fn step_moves_avatars() {
        let mut server = arena_server().await;
        let client = ClientId(0);
        server.with_context(|arena, ctx| arena.client_loaded(ctx, client));
        let object = server.listener().avatar_of(client).unwrap();
        let start_x = server.directory().get_as::<Avatar>(object).unwrap().state.x;

        let body = move_body(1, true, true);
        server.with_context(|arena, ctx| {
            arena.client_component_request(ctx, client, object, MOVE_REQUEST, &body);
            arena.step(ctx, 0.1);
        });

        let avatar = server.directory().get_as::<Avatar>(object).unwrap();
        assert_approx_eq!(avatar.state.x, start_x + AVATAR_SPEED * 0.1, 0.01);
        assert!(!avatar.state.on_ground);
    }

    #[tokio::test]
    async fn departed_client_hands_avatar_to_server() {
        let mut server = arena_server().await;
        let client = ClientId(1);
        server.with_context(|arena, ctx| arena.client_loaded(ctx, client));
        let object = server.listener().avatar_of(client).unwrap();

        server.with_context(|arena, ctx| arena.client_disconnected(ctx, client));

        assert!(server.listener().avatar_of(client).is_none());
        assert_eq!(server.directory().owner(object), Some(Owner::Server));
    }
}
