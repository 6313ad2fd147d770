//! Room pairing: maps a room name to at most two endpoints and gives each a
//! stable seat. Pure in-memory bookkeeping; the websocket layer owns all I/O.

use chrono::{DateTime, Utc};
use heartlink_proto::{EndpointId, Role, SessionStatus};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    #[error("room {room} already has two occupants")]
    SessionFull { room: String },
    #[error("endpoint is already seated in room {room}")]
    AlreadySeated { room: String },
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub session_id: String,
    pub room: String,
    pub role: Role,
    pub status: SessionStatus,
    /// The other occupant, if any.
    pub peer: Option<EndpointId>,
    /// True only for the join that filled the second seat.
    pub newly_paired: bool,
}

/// Result of an endpoint leaving its room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub session_id: String,
    pub room: String,
    pub role: Role,
    pub remaining: Option<EndpointId>,
}

#[derive(Debug, Clone)]
struct Session {
    id: String,
    room: String,
    a: Option<EndpointId>,
    b: Option<EndpointId>,
    created_at: DateTime<Utc>,
}

impl Session {
    fn new(room: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            room: room.to_string(),
            a: None,
            b: None,
            created_at: Utc::now(),
        }
    }

    fn seat(&self, role: Role) -> Option<&EndpointId> {
        match role {
            Role::A => self.a.as_ref(),
            Role::B => self.b.as_ref(),
        }
    }

    fn seat_mut(&mut self, role: Role) -> &mut Option<EndpointId> {
        match role {
            Role::A => &mut self.a,
            Role::B => &mut self.b,
        }
    }

    fn role_of(&self, endpoint: &EndpointId) -> Option<Role> {
        [Role::A, Role::B]
            .into_iter()
            .find(|role| self.seat(*role) == Some(endpoint))
    }

    /// First free seat, A before B.
    fn free_role(&self) -> Option<Role> {
        [Role::A, Role::B]
            .into_iter()
            .find(|role| self.seat(*role).is_none())
    }

    fn occupant_count(&self) -> usize {
        usize::from(self.a.is_some()) + usize::from(self.b.is_some())
    }

    fn status(&self) -> SessionStatus {
        if self.occupant_count() == 2 {
            SessionStatus::Active
        } else {
            SessionStatus::Waiting
        }
    }

    fn assignment(&self, role: Role, newly_paired: bool) -> Assignment {
        Assignment {
            session_id: self.id.clone(),
            room: self.room.clone(),
            role,
            status: self.status(),
            peer: self.seat(role.other()).cloned(),
            newly_paired,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OccupantSnapshot {
    pub id: EndpointId,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub room: String,
    pub status: SessionStatus,
    pub occupants: Vec<OccupantSnapshot>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PairingStats {
    pub total_sessions: usize,
    pub waiting_sessions: usize,
    pub active_sessions: usize,
}

#[derive(Debug, Default)]
pub struct PairingRegistry {
    rooms: HashMap<String, Session>,
    seated: HashMap<EndpointId, String>,
}

impl PairingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seats `endpoint` in `room`. Re-joining the same room returns the
    /// existing seat; a third endpoint is rejected without touching the room.
    pub fn join(&mut self, endpoint: &EndpointId, room: &str) -> Result<Assignment, PairingError> {
        if let Some(current_room) = self.seated.get(endpoint) {
            if current_room != room {
                return Err(PairingError::AlreadySeated {
                    room: current_room.clone(),
                });
            }
            if let Some(session) = self.rooms.get(room) {
                if let Some(role) = session.role_of(endpoint) {
                    return Ok(session.assignment(role, false));
                }
            }
        }

        let session = self
            .rooms
            .entry(room.to_string())
            .or_insert_with(|| Session::new(room));
        let role = session.free_role().ok_or_else(|| PairingError::SessionFull {
            room: room.to_string(),
        })?;
        *session.seat_mut(role) = Some(endpoint.clone());
        let newly_paired = session.occupant_count() == 2;
        let assignment = session.assignment(role, newly_paired);
        self.seated.insert(endpoint.clone(), room.to_string());
        Ok(assignment)
    }

    /// Frees the endpoint's seat. An emptied room is destroyed; a room with
    /// one occupant left goes back to waiting and keeps that occupant's role.
    pub fn leave(&mut self, endpoint: &EndpointId) -> Option<Departure> {
        let room = self.seated.remove(endpoint)?;
        let session = self.rooms.get_mut(&room)?;
        let role = session.role_of(endpoint)?;
        *session.seat_mut(role) = None;
        let departure = Departure {
            session_id: session.id.clone(),
            room: room.clone(),
            role,
            remaining: session.seat(role.other()).cloned(),
        };
        if session.occupant_count() == 0 {
            self.rooms.remove(&room);
        }
        Some(departure)
    }

    pub fn peer_of(&self, endpoint: &EndpointId) -> Option<EndpointId> {
        let room = self.seated.get(endpoint)?;
        let session = self.rooms.get(room)?;
        let role = session.role_of(endpoint)?;
        session.seat(role.other()).cloned()
    }

    pub fn occupants(&self, room: &str) -> Vec<(Role, EndpointId)> {
        self.rooms
            .get(room)
            .map(|session| {
                [Role::A, Role::B]
                    .into_iter()
                    .filter_map(|role| session.seat(role).map(|id| (role, id.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<SessionSnapshot> = self
            .rooms
            .values()
            .map(|session| SessionSnapshot {
                session_id: session.id.clone(),
                room: session.room.clone(),
                status: session.status(),
                occupants: self
                    .occupants(&session.room)
                    .into_iter()
                    .map(|(role, id)| OccupantSnapshot { id, role })
                    .collect(),
                created_at: session.created_at,
            })
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub fn stats(&self) -> PairingStats {
        let active_sessions = self
            .rooms
            .values()
            .filter(|session| session.status() == SessionStatus::Active)
            .count();
        PairingStats {
            total_sessions: self.rooms.len(),
            waiting_sessions: self.rooms.len() - active_sessions,
            active_sessions,
        }
    }
}
