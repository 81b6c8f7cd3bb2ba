use crate::network::{ClientListener, SessionError};
use log::{debug, error, info, warn};
use shared::avatar::{Avatar, MoveRequest, JUMPED_EVENT};
use shared::{ClientDirectory, ClientId, EventId, ObjectId, Owner};

/// Demo game mode for the client: follows its own avatar and predicts its
/// movement between server updates.
#[derive(Debug, Default)]
pub struct ClientGame {
    client_id: Option<ClientId>,
    host_started: bool,
    disconnected: bool,
    jumps_seen: usize,
    sequence: u32,
    predicted: Option<Avatar>,
}

impl ClientGame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_host_started(&self) -> bool {
        self.host_started
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn jumps_seen(&self) -> usize {
        self.jumps_seen
    }

    /// The avatar the server assigned to this client, if replicated yet
    pub fn own_avatar<'a>(&self, directory: &'a ClientDirectory) -> Option<(ObjectId, &'a Avatar)> {
        let me = Owner::Client(self.client_id?);
        directory
            .ids()
            .filter(move |&id| directory.owner(id) == Some(me))
            .find_map(move |id| directory.get_as::<Avatar>(id).map(|avatar| (id, avatar)))
    }

    /// Builds the next move request with a fresh sequence number
    pub fn next_move(&mut self, left: bool, right: bool, jump: bool) -> MoveRequest {
        self.sequence += 1;
        MoveRequest {
            sequence: self.sequence,
            left,
            right,
            jump,
        }
    }

    /// Re-bases the prediction on the last replicated state, then applies
    /// `request` locally for `dt` seconds
    pub fn predict(&mut self, directory: &ClientDirectory, request: &MoveRequest, dt: f32) -> Option<&Avatar> {
        let (_, server_avatar) = self.own_avatar(directory)?;
        let mut avatar = server_avatar.clone();
        avatar.apply_move(request);
        avatar.step(dt);
        self.predicted = Some(avatar);
        self.predicted.as_ref()
    }

    pub fn predicted(&self) -> Option<&Avatar> {
        self.predicted.as_ref()
    }
}

/// Input for an unattended client: walk right, walk left, jump now and then
pub fn scripted_input(tick: u64) -> (bool, bool, bool) {
    let walking_right = (tick / 60) % 2 == 0;
    (!walking_right, walking_right, tick % 90 == 45)
}

impl ClientListener for ClientGame {
    fn connected(&mut self, client: ClientId) {
        info!("Joined as client {}", client);
        self.client_id = Some(client);
        self.disconnected = false;
    }

    fn disconnected(&mut self) {
        info!("Left the server");
        self.client_id = None;
        self.host_started = false;
        self.predicted = None;
        self.disconnected = true;
    }

    fn unknown_host(&mut self, host: &str) {
        error!("Cannot resolve server address {}", host);
    }

    fn could_not_connect(&mut self, error: &SessionError) {
        error!("Could not connect: {}", error);
    }

    fn error(&mut self, error: &SessionError) {
        warn!("Network error: {}", error);
    }

    fn host_started(&mut self) {
        info!("Host started the game, loading...");
        self.host_started = true;
    }

    fn server_event(
        &mut self,
        directory: &ClientDirectory,
        object: ObjectId,
        event: EventId,
        _body: &[u8],
    ) {
        if event != JUMPED_EVENT {
            debug!("Ignoring event {:?} on object {}", event, object);
            return;
        }
        self.jumps_seen += 1;
        if let Some(avatar) = directory.get_as::<Avatar>(object) {
            debug!(
                "Avatar {} jumped at ({:.1}, {:.1})",
                object, avatar.state.x, avatar.state.y
            );
        }
    }
}
