//! Room roster and live stream references
//!
//! Pure bookkeeping: nothing here talks to the network. Peers are never
//! deleted when the server reports them removed, so stale metadata stays
//! queryable.

use huddle_protocol::{Attributes, PeerInfo, PublishedStream, RoomInfo};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamDirection {
    Local,
    Remote,
}

/// Handle to one published (local) or subscribed (remote) stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRef {
    pub stream_id: String,
    pub owner_peer_id: String,
    pub direction: StreamDirection,
    pub attributes: Attributes,
    pub audio_muted: bool,
    pub video_muted: bool,
    /// Remote media track has arrived
    pub media_bound: bool,
    /// Server-side id of our subscription, remote streams only
    pub subscriber_stream_id: Option<String>,
}

impl StreamRef {
    pub fn local(stream_id: impl Into<String>, owner: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            stream_id: stream_id.into(),
            owner_peer_id: owner.into(),
            direction: StreamDirection::Local,
            attributes,
            audio_muted: false,
            video_muted: false,
            media_bound: false,
            subscriber_stream_id: None,
        }
    }

    pub fn remote(
        stream_id: impl Into<String>,
        owner: impl Into<String>,
        attributes: Attributes,
        subscriber_stream_id: String,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            owner_peer_id: owner.into(),
            direction: StreamDirection::Remote,
            attributes,
            audio_muted: false,
            video_muted: false,
            media_bound: false,
            subscriber_stream_id: Some(subscriber_stream_id),
        }
    }

    pub fn is_local(&self) -> bool {
        self.direction == StreamDirection::Local
    }

    pub fn key(&self) -> StreamKey {
        StreamKey::new(&self.owner_peer_id, &self.stream_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub owner_peer_id: String,
    pub stream_id: String,
}

impl StreamKey {
    pub fn new(owner: &str, stream_id: &str) -> Self {
        Self {
            owner_peer_id: owner.to_string(),
            stream_id: stream_id.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RoomSession {
    local_peer_id: String,
    room: String,
    peers: HashMap<String, PeerInfo>,
    streams: HashMap<StreamKey, StreamRef>,
}

impl RoomSession {
    pub fn new(local_peer_id: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            local_peer_id: local_peer_id.into(),
            room: room.into(),
            peers: HashMap::new(),
            streams: HashMap::new(),
        }
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    // Roster

    /// Insert or replace a peer. Returns true if the peer was not known.
    pub fn upsert_peer(&mut self, peer: PeerInfo) -> bool {
        self.peers.insert(peer.peer_id.clone(), peer).is_none()
    }

    /// Merge a room snapshot into the roster
    pub fn merge_roster(&mut self, room: RoomInfo) {
        for peer in room.peers {
            self.upsert_peer(peer);
        }
    }

    /// Acknowledge a `peerremoved` notification. The entry is kept.
    /// Returns whether the peer is known.
    pub fn mark_peer_removed(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn peer(&self, peer_id: &str) -> Option<&PeerInfo> {
        self.peers.get(peer_id)
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.values().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Peer that announced `stream_id`, by linear scan
    pub fn peer_for_stream(&self, stream_id: &str) -> Option<&str> {
        self.peers
            .values()
            .find(|peer| peer.has_stream(stream_id))
            .map(|peer| peer.peer_id.as_str())
    }

    pub fn add_published_stream(&mut self, peer_id: &str, stream: PublishedStream) {
        let peer = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerInfo::new(peer_id));

        match peer.streams.iter_mut().find(|s| s.stream_id == stream.stream_id) {
            Some(existing) => *existing = stream,
            None => peer.streams.push(stream),
        }
    }

    /// Returns false if the stream was not in the roster
    pub fn remove_published_stream(&mut self, peer_id: &str, stream_id: &str) -> bool {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return false;
        };
        let before = peer.streams.len();
        peer.streams.retain(|s| s.stream_id != stream_id);
        peer.streams.len() != before
    }

    /// Apply new attributes to the roster entry and any live ref of `stream_id`
    pub fn update_attributes(&mut self, stream_id: &str, attributes: &Attributes) -> bool {
        let mut found = false;
        for peer in self.peers.values_mut() {
            for stream in peer.streams.iter_mut().filter(|s| s.stream_id == stream_id) {
                stream.attributes = attributes.clone();
                found = true;
            }
        }
        for stream in self.streams.values_mut().filter(|s| s.stream_id == stream_id) {
            stream.attributes = attributes.clone();
            found = true;
        }
        found
    }

    pub fn published_attributes(&self, stream_id: &str) -> Option<&Attributes> {
        self.peers
            .values()
            .flat_map(|peer| peer.streams.iter())
            .find(|s| s.stream_id == stream_id)
            .map(|s| &s.attributes)
    }

    // Stream refs

    /// Insert a stream ref. Refuses a second ref for the same (owner, stream id).
    pub fn insert_stream(&mut self, stream: StreamRef) -> bool {
        let key = stream.key();
        if self.streams.contains_key(&key) {
            return false;
        }
        self.streams.insert(key, stream);
        true
    }

    pub fn remove_stream(&mut self, owner: &str, stream_id: &str) -> Option<StreamRef> {
        self.streams.remove(&StreamKey::new(owner, stream_id))
    }

    pub fn stream(&self, owner: &str, stream_id: &str) -> Option<&StreamRef> {
        self.streams.get(&StreamKey::new(owner, stream_id))
    }

    pub fn stream_mut(&mut self, owner: &str, stream_id: &str) -> Option<&mut StreamRef> {
        self.streams.get_mut(&StreamKey::new(owner, stream_id))
    }

    pub fn local_stream(&self, stream_id: &str) -> Option<&StreamRef> {
        self.streams
            .get(&StreamKey::new(&self.local_peer_id, stream_id))
            .filter(|s| s.is_local())
    }

    pub fn remote_stream(&self, stream_id: &str) -> Option<&StreamRef> {
        self.streams
            .values()
            .find(|s| s.stream_id == stream_id && !s.is_local())
    }

    pub fn remote_stream_mut(&mut self, stream_id: &str) -> Option<&mut StreamRef> {
        self.streams
            .values_mut()
            .find(|s| s.stream_id == stream_id && !s.is_local())
    }

    /// Any live ref with this id, local first
    pub fn find_stream_mut(&mut self, stream_id: &str) -> Option<&mut StreamRef> {
        let local_key = StreamKey::new(&self.local_peer_id, stream_id);
        if self.streams.contains_key(&local_key) {
            return self.streams.get_mut(&local_key);
        }
        self.streams.values_mut().find(|s| s.stream_id == stream_id)
    }

    pub fn streams_snapshot(&self) -> Vec<StreamRef> {
        self.streams.values().cloned().collect()
    }

    /// Drop every stream ref, returning them
    pub fn clear_streams(&mut self) -> Vec<StreamRef> {
        self.streams.drain().map(|(_, stream)| stream).collect()
    }
}
