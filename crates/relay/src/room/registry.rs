// Room registry: document id -> connected participants + canonical state.
//
// A room is created when the first participant joins a document id and
// discarded when the last one leaves. The registry's map lock only guards
// membership bookkeeping; reconciliation goes through each room's own
// serialization point, so rooms never contend with each other on edits.
// No lock is ever held across a network send: broadcasts collect channel
// senders under the lock, then send after releasing it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use quillsync_common::protocol::ws::{ParticipantInfo, SelectionRange, WsMessage};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::identity::UserIdentity;
use crate::presence::{color_for, CursorState};
use crate::room::reconciler::Reconciler;
use crate::store::DocumentStore;

/// A connected room member. Owned by the registry; the presence tracker
/// writes cursor state through this record rather than keeping its own map.
#[derive(Debug)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub color: String,
    pub last_heartbeat: DateTime<Utc>,
    pub cursor: Option<CursorState>,
    outbound: mpsc::UnboundedSender<WsMessage>,
}

impl Participant {
    pub fn new(identity: &UserIdentity, outbound: mpsc::UnboundedSender<WsMessage>) -> Self {
        Self {
            id: identity.participant_id.clone(),
            display_name: identity.display_name.clone(),
            color: color_for(&identity.participant_id).to_owned(),
            last_heartbeat: Utc::now(),
            cursor: None,
            outbound,
        }
    }

    fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            participant_id: self.id.clone(),
            display_name: self.display_name.clone(),
            color: self.color.clone(),
        }
    }
}

/// One document's synchronization unit.
pub struct Room {
    pub document_id: String,
    pub reconciler: Reconciler,
    participants: RwLock<HashMap<String, Participant>>,
}

impl Room {
    fn new(document_id: &str, content: String, revision: u64) -> Self {
        Self {
            document_id: document_id.to_owned(),
            reconciler: Reconciler::new(content, revision),
            participants: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace a participant. Returns true when an entry for the
    /// same id already existed (idempotent rejoin: replaced, not appended).
    async fn insert_participant(&self, participant: Participant) -> bool {
        let mut participants = self.participants.write().await;
        participants.insert(participant.id.clone(), participant).is_some()
    }

    async fn remove_participant(&self, participant_id: &str) -> bool {
        self.participants.write().await.remove(participant_id).is_some()
    }

    pub async fn participant_count(&self) -> usize {
        self.participants.read().await.len()
    }

    pub async fn participant_infos(&self) -> Vec<ParticipantInfo> {
        let participants = self.participants.read().await;
        let mut infos: Vec<ParticipantInfo> =
            participants.values().map(Participant::info).collect();
        infos.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        infos
    }

    /// Refresh a participant's heartbeat; any inbound message counts.
    pub async fn touch(&self, participant_id: &str) {
        if let Some(participant) = self.participants.write().await.get_mut(participant_id) {
            participant.last_heartbeat = Utc::now();
        }
    }

    /// Last-write-wins cursor overwrite; returns the broadcast message, or
    /// `None` when the participant is not (or no longer) a member.
    pub async fn update_cursor(
        &self,
        participant_id: &str,
        position: usize,
        selection: Option<SelectionRange>,
    ) -> Option<WsMessage> {
        let mut participants = self.participants.write().await;
        let participant = participants.get_mut(participant_id)?;
        participant.cursor = Some(CursorState { position, selection });
        participant.last_heartbeat = Utc::now();
        Some(WsMessage::CursorUpdate {
            document_id: self.document_id.clone(),
            participant_id: participant_id.to_owned(),
            position,
            selection,
            color: participant.color.clone(),
        })
    }

    /// Participants whose last heartbeat is older than `cutoff`.
    async fn stale_participants(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        self.participants
            .read()
            .await
            .values()
            .filter(|participant| participant.last_heartbeat < cutoff)
            .map(|participant| participant.id.clone())
            .collect()
    }

    /// Send to every member. Returns the ids whose channel was closed;
    /// the registry evicts those through the same path as a timeout.
    pub async fn broadcast(&self, message: &WsMessage) -> Vec<String> {
        self.broadcast_filtered(message, None).await
    }

    /// Send to every member except `exclude`.
    pub async fn broadcast_excluding(&self, message: &WsMessage, exclude: &str) -> Vec<String> {
        self.broadcast_filtered(message, Some(exclude)).await
    }

    async fn broadcast_filtered(&self, message: &WsMessage, exclude: Option<&str>) -> Vec<String> {
        let recipients: Vec<(String, mpsc::UnboundedSender<WsMessage>)> = {
            let participants = self.participants.read().await;
            participants
                .values()
                .filter(|participant| exclude != Some(participant.id.as_str()))
                .map(|participant| (participant.id.clone(), participant.outbound.clone()))
                .collect()
        };

        let mut failed = Vec::new();
        for (participant_id, sender) in recipients {
            if sender.send(message.clone()).is_err() {
                failed.push(participant_id);
            }
        }
        failed
    }
}

/// Room snapshot handed to a joiner in `join_ack`.
#[derive(Debug, Clone)]
pub struct JoinSnapshot {
    pub revision: u64,
    pub content: String,
    pub participants: Vec<ParticipantInfo>,
}

pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    store: DocumentStore,
}

impl RoomRegistry {
    pub fn new(store: DocumentStore) -> Self {
        Self { rooms: RwLock::new(HashMap::new()), store }
    }

    pub async fn room(&self, document_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(document_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Enter a room, creating it on first join (seeding content from the
    /// document store). Returns the room and the snapshot for `join_ack`.
    ///
    /// Idempotent per participant id: a rejoin replaces the stale entry and
    /// is not re-announced to the room. The participant is inserted before
    /// the snapshot is taken, so a concurrently reconciled edit may reach
    /// the joiner both inside the snapshot and as a broadcast; the revision
    /// number on every broadcast lets the client drop the duplicate.
    pub async fn join(
        &self,
        document_id: &str,
        identity: &UserIdentity,
        outbound: mpsc::UnboundedSender<WsMessage>,
    ) -> (Arc<Room>, JoinSnapshot) {
        let (room, rejoined) = {
            let mut rooms = self.rooms.write().await;
            let room = match rooms.get(document_id) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let (content, revision) = self.store.load_content(document_id).await;
                    debug!(document_id, revision, "creating room");
                    let created = Arc::new(Room::new(document_id, content, revision));
                    rooms.insert(document_id.to_owned(), Arc::clone(&created));
                    created
                }
            };
            // Inserted under the map lock so teardown cannot race the join.
            let rejoined = room.insert_participant(Participant::new(identity, outbound)).await;
            (room, rejoined)
        };

        let (content, revision) = room.reconciler.snapshot().await;
        let snapshot =
            JoinSnapshot { revision, content, participants: room.participant_infos().await };

        if !rejoined {
            let joined = WsMessage::ParticipantJoined {
                document_id: document_id.to_owned(),
                participant_id: identity.participant_id.clone(),
                display_name: identity.display_name.clone(),
                color: color_for(&identity.participant_id).to_owned(),
            };
            let failed = room.broadcast_excluding(&joined, &identity.participant_id).await;
            self.evict(&room, failed).await;
        }

        (room, snapshot)
    }

    /// Remove a participant, announce it, and discard the room if empty.
    /// Returns false when the participant was not a member (so callers can
    /// guarantee at-most-once `participant_left` per departure).
    pub async fn leave(&self, document_id: &str, participant_id: &str) -> bool {
        let Some(room) = self.room(document_id).await else {
            return false;
        };
        if !room.remove_participant(participant_id).await {
            return false;
        }

        let left = WsMessage::ParticipantLeft {
            document_id: document_id.to_owned(),
            participant_id: participant_id.to_owned(),
        };
        let failed = room.broadcast(&left).await;
        self.evict(&room, failed).await;

        self.drop_room_if_empty(document_id).await;
        true
    }

    /// Connection teardown: leave every room the client was a member of.
    pub async fn disconnect(&self, document_ids: &[String], participant_id: &str) {
        for document_id in document_ids {
            self.leave(document_id, participant_id).await;
        }
    }

    /// Refresh heartbeats across all of a client's rooms.
    pub async fn touch_participant(&self, document_ids: &[String], participant_id: &str) {
        for document_id in document_ids {
            if let Some(room) = self.room(document_id).await {
                room.touch(participant_id).await;
            }
        }
    }

    /// Broadcast to a room and evict members whose channel has closed.
    pub async fn broadcast_to_room(&self, room: &Arc<Room>, message: &WsMessage) {
        let failed = room.broadcast(message).await;
        self.evict(room, failed).await;
    }

    /// Broadcast to everyone in a room except `exclude`, evicting members
    /// whose channel has closed.
    pub async fn broadcast_to_room_excluding(
        &self,
        room: &Arc<Room>,
        message: &WsMessage,
        exclude: &str,
    ) {
        let failed = room.broadcast_excluding(message, exclude).await;
        self.evict(room, failed).await;
    }

    /// Evict participants whose channel rejected a send. The nested leave
    /// is boxed: a leave broadcasts, the broadcast can fail and evict in
    /// turn, and the cycle would otherwise make the future infinitely
    /// sized. The cascade terminates because every step removes a member.
    async fn evict(&self, room: &Arc<Room>, failed: Vec<String>) {
        for participant_id in failed {
            warn!(
                document_id = %room.document_id,
                participant_id = %participant_id,
                "dropping participant with closed outbound channel"
            );
            Box::pin(self.leave(&room.document_id, &participant_id)).await;
        }
    }

    /// Liveness sweep: evict every participant silent for longer than
    /// `timeout`, announcing each departure exactly once. Returns the
    /// number of evictions.
    pub async fn evict_stale(&self, timeout: Duration) -> usize {
        let cutoff = Utc::now() - timeout;
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();

        let mut evicted = 0;
        for room in rooms {
            for participant_id in room.stale_participants(cutoff).await {
                if self.leave(&room.document_id, &participant_id).await {
                    debug!(
                        document_id = %room.document_id,
                        participant_id = %participant_id,
                        "evicted idle participant"
                    );
                    evicted += 1;
                }
            }
        }
        evicted
    }

    async fn drop_room_if_empty(&self, document_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(document_id) {
            if room.participant_count().await == 0 {
                debug!(document_id, "discarding empty room");
                rooms.remove(document_id);
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn backdate_heartbeat(
        &self,
        document_id: &str,
        participant_id: &str,
        age: Duration,
    ) {
        if let Some(room) = self.room(document_id).await {
            let mut participants = room.participants.write().await;
            if let Some(participant) = participants.get_mut(participant_id) {
                participant.last_heartbeat = Utc::now() - age;
            }
        }
    }
}
