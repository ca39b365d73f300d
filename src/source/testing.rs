//! Scripted in-memory `EventSource` for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Event, EventSource, Page, RoomId, SessionInfo, SourceError};

#[derive(Default)]
pub(crate) struct FakeSource {
    rooms: Vec<RoomId>,
    labels: HashMap<RoomId, String>,
    pages: HashMap<(RoomId, String), Page>,
    fetch_errors: HashMap<(RoomId, String), SourceError>,
    label_errors: HashMap<RoomId, SourceError>,
    handshake: Mutex<VecDeque<Result<SessionInfo, SourceError>>>,
    pub(crate) fetch_log: Mutex<Vec<(RoomId, String)>>,
    pub(crate) verify_calls: Mutex<u32>,
}

impl FakeSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_room(mut self, room_id: &str, label: &str) -> Self {
        let id = RoomId::new(room_id);
        self.labels.insert(id.clone(), label.to_string());
        self.rooms.push(id);
        self
    }

    /// Serve `events` for a request starting at `from`, continuing at `end`.
    pub(crate) fn with_page(
        mut self,
        room_id: &str,
        from: &str,
        events: Vec<Event>,
        end: &str,
    ) -> Self {
        let page = Page {
            events,
            start: from.to_string(),
            end: Some(end.to_string()),
        };
        self.pages.insert((RoomId::new(room_id), from.to_string()), page);
        self
    }

    pub(crate) fn with_fetch_error(mut self, room_id: &str, from: &str, err: SourceError) -> Self {
        self.fetch_errors.insert((RoomId::new(room_id), from.to_string()), err);
        self
    }

    pub(crate) fn with_label_error(mut self, room_id: &str, err: SourceError) -> Self {
        self.label_errors.insert(RoomId::new(room_id), err);
        self
    }

    /// Queue handshake outcomes; once drained, verification succeeds.
    pub(crate) fn with_handshake(self, outcomes: Vec<Result<SessionInfo, SourceError>>) -> Self {
        *self.handshake.lock().unwrap() = outcomes.into();
        self
    }

    pub(crate) fn fetches(&self) -> Vec<(RoomId, String)> {
        self.fetch_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSource for FakeSource {
    async fn verify_session(&self) -> Result<SessionInfo, SourceError> {
        *self.verify_calls.lock().unwrap() += 1;
        match self.handshake.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Ok(SessionInfo {
                user_id: "@backup:example.org".into(),
                device_id: Some("DEVICE".into()),
            }),
        }
    }

    async fn list_rooms(&self) -> Result<Vec<RoomId>, SourceError> {
        Ok(self.rooms.clone())
    }

    async fn resolve_label(&self, room_id: &RoomId) -> Result<String, SourceError> {
        if let Some(err) = self.label_errors.get(room_id) {
            return Err(err.clone());
        }
        Ok(self
            .labels
            .get(room_id)
            .cloned()
            .unwrap_or_else(|| room_id.to_string()))
    }

    async fn fetch_page(
        &self,
        room_id: &RoomId,
        from: &str,
        _limit: u32,
    ) -> Result<Page, SourceError> {
        let key = (room_id.clone(), from.to_string());
        self.fetch_log.lock().unwrap().push(key.clone());
        if let Some(err) = self.fetch_errors.get(&key) {
            return Err(err.clone());
        }
        Ok(self.pages.get(&key).cloned().unwrap_or_else(|| Page {
            events: Vec::new(),
            start: from.to_string(),
            end: Some(from.to_string()),
        }))
    }
}

pub(crate) fn event(id: &str, ts: i64) -> Event {
    Event::new(id, ts)
}
