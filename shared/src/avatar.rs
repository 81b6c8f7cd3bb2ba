//! Demo content: a player-driven avatar replicated through the directory
//!
//! The avatar state and move requests travel as `bincode` bodies inside
//! update and client-request messages.

use crate::directory::{ApplyError, Replica, Templates};
use crate::ids::{EventId, RequestId, TemplateId};
use log::error;
use serde::{Deserialize, Serialize};

pub const GRAVITY: f32 = 980.0;
pub const AVATAR_SPEED: f32 = 300.0;
pub const JUMP_VELOCITY: f32 = -400.0;
pub const FLOOR_Y: f32 = 550.0;
pub const WORLD_WIDTH: f32 = 800.0;
pub const AVATAR_SIZE: f32 = 32.0;

pub const AVATAR_TEMPLATE: &str = "avatar";

/// Request id of [`MoveRequest`] bodies sent against an avatar
pub const MOVE_REQUEST: RequestId = RequestId(0);

/// Event id broadcast when an avatar leaves the ground
pub const JUMPED_EVENT: EventId = EventId(0);

/// Registers every demo template; both ends call this so ids line up
pub fn demo_templates() -> Templates {
    let mut templates = Templates::new();
    templates.register(AVATAR_TEMPLATE, || Box::new(Avatar::default()));
    templates
}

pub fn avatar_template(templates: &Templates) -> Option<TemplateId> {
    templates.find(AVATAR_TEMPLATE)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarState {
    pub x: f32,
    pub y: f32,
    pub vel_x: f32,
    pub vel_y: f32,
    pub on_ground: bool,
}

#[derive(Debug, Clone)]
pub struct Avatar {
    pub state: AvatarState,
    dirty: bool,
}

impl Default for Avatar {
    fn default() -> Self {
        Self::new(0.0, FLOOR_Y - AVATAR_SIZE)
    }
}

impl Avatar {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            state: AvatarState {
                x,
                y,
                vel_x: 0.0,
                vel_y: 0.0,
                on_ground: true,
            },
            dirty: true,
        }
    }

    pub fn bounds(&self) -> (f32, f32, f32, f32) {
        let s = &self.state;
        (s.x, s.y, s.x + AVATAR_SIZE, s.y + AVATAR_SIZE)
    }

    pub fn center(&self) -> (f32, f32) {
        (
            self.state.x + AVATAR_SIZE / 2.0,
            self.state.y + AVATAR_SIZE / 2.0,
        )
    }

    /// Applies a move request; returns true if the avatar jumped
    pub fn apply_move(&mut self, request: &MoveRequest) -> bool {
        let s = &mut self.state;
        s.vel_x = match (request.left, request.right) {
            (true, false) => -AVATAR_SPEED,
            (false, true) => AVATAR_SPEED,
            _ => 0.0,
        };

        let jumped = request.jump && s.on_ground;
        if jumped {
            s.vel_y = JUMP_VELOCITY;
            s.on_ground = false;
        }
        self.dirty = true;
        jumped
    }

    /// Advances the simulation by `dt` seconds
    pub fn step(&mut self, dt: f32) {
        let s = &mut self.state;
        if s.vel_x == 0.0 && s.vel_y == 0.0 && s.on_ground {
            return;
        }

        if !s.on_ground {
            s.vel_y += GRAVITY * dt;
        }
        s.x = (s.x + s.vel_x * dt).clamp(0.0, WORLD_WIDTH - AVATAR_SIZE);
        s.y += s.vel_y * dt;

        if s.y + AVATAR_SIZE >= FLOOR_Y {
            s.y = FLOOR_Y - AVATAR_SIZE;
            s.vel_y = 0.0;
            s.on_ground = true;
        }
        self.dirty = true;
    }
}

impl Replica for Avatar {
    fn write_update(&self, out: &mut Vec<u8>) {
        match bincode::serialize(&self.state) {
            Ok(bytes) => out.extend_from_slice(&bytes),
            Err(e) => error!("Failed to serialize avatar state: {}", e),
        }
    }

    fn apply_update(&mut self, body: &[u8]) -> Result<(), ApplyError> {
        self.state = bincode::deserialize(body)?;
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

pub fn check_collision(a: &Avatar, b: &Avatar) -> bool {
    let (x1, y1, x2, y2) = a.bounds();
    let (x3, y3, x4, y4) = b.bounds();

    !(x2 <= x3 || x4 <= x1 || y2 <= y3 || y4 <= y1)
}

/// Pushes overlapping avatars apart and exchanges damped velocities
pub fn resolve_collision(a: &mut Avatar, b: &mut Avatar) {
    if !check_collision(a, b) {
        return;
    }

    let (cx1, cy1) = a.center();
    let (cx2, cy2) = b.center();
    let dx = cx2 - cx1;
    let dy = cy2 - cy1;
    let distance = (dx * dx + dy * dy).sqrt();

    if distance < 0.001 {
        a.state.x -= AVATAR_SIZE / 2.0;
        b.state.x += AVATAR_SIZE / 2.0;
    } else {
        let separation = (AVATAR_SIZE - distance).max(0.0) / 2.0;
        let (nx, ny) = (dx / distance, dy / distance);
        a.state.x -= nx * separation;
        a.state.y -= ny * separation;
        b.state.x += nx * separation;
        b.state.y += ny * separation;

        let (vx, vy) = (a.state.vel_x, a.state.vel_y);
        a.state.vel_x = b.state.vel_x * 0.8;
        a.state.vel_y = b.state.vel_y * 0.8;
        b.state.vel_x = vx * 0.8;
        b.state.vel_y = vy * 0.8;
    }

    for avatar in [a, b] {
        avatar.state.x = avatar.state.x.clamp(0.0, WORLD_WIDTH - AVATAR_SIZE);
        avatar.state.y = avatar.state.y.clamp(0.0, FLOOR_Y - AVATAR_SIZE);
        avatar.dirty = true;
    }
}

/// Input a client sends for the avatar it owns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveRequest {
    pub sequence: u32,
    pub left: bool,
    pub right: bool,
    pub jump: bool,
}

impl MoveRequest {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(body: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(body)
    }
}
