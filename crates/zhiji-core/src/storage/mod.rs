//! Flat-file JSON persistence.
//!
//! Layout under `data_dir`:
//!
//! ```text
//! sessions.json                       {sid: {user_id, created_at, updated_at}}
//! messages/{sid}.json                 [ChatMessage]
//! messages/{sid}_mood.json            [MoodRecord]
//! plans/{sid}.json                    Plan
//! plans/{sid}_inquiry.json            latest inquiry result
//! plans/{sid}_inquiry_history.json    [inquiry result]
//! patterns/{sid}.json                 pattern analysis
//! events/{sid}.json                   [Event]
//! users/{uid}/profile.json            UserProfile
//! users/{uid}/memory.json             [MemoryEntry]
//! users/{uid}/emotions.json           [EmotionRecord]
//! ```
//!
//! Every public operation takes the store-wide lock, so read-modify-write
//! cycles never interleave within one process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{Result, ZhijiError};
use crate::model::*;

pub struct JsonStore {
    root: PathBuf,
    lock: Mutex<()>,
    lock_timeout: Duration,
}

impl std::fmt::Debug for JsonStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonStore").field("root", &self.root).finish()
    }
}

type SessionIndex = BTreeMap<String, SessionMeta>;

/// Reject ids that would escape the data directory.
/// Reject ids that cannot name a file under the data root.
pub fn safe_id<'a>(kind: &str, id: &'a str) -> Result<&'a str> {
    if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
        return Err(ZhijiError::InvalidInput(format!("invalid {kind} id: '{id}'")));
    }
    Ok(id)
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(None),
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            ZhijiError::Storage(format!("corrupt JSON in {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn read_list<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    Ok(read_json(path).await?.unwrap_or_default())
}

/// Write pretty JSON through a temp file so readers never see half a file.
async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn last_n<T>(mut items: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(n) = limit {
        let skip = items.len().saturating_sub(n);
        items.drain(..skip);
    }
    items
}

impl JsonStore {
    pub fn new(root: impl Into<PathBuf>, lock_timeout_secs: u64) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
            lock_timeout: Duration::from_secs(lock_timeout_secs),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn guard(&self) -> Result<MutexGuard<'_, ()>> {
        tokio::time::timeout(self.lock_timeout, self.lock.lock())
            .await
            .map_err(|_| {
                ZhijiError::Timeout(format!(
                    "data store lock after {}s",
                    self.lock_timeout.as_secs()
                ))
            })
    }

    // ── paths ──────────────────────────────────────────────────────────

    fn sessions_path(&self) -> PathBuf {
        self.root.join("sessions.json")
    }

    fn messages_path(&self, sid: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join("messages")
            .join(format!("{}.json", safe_id("session", sid)?)))
    }

    fn mood_path(&self, sid: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join("messages")
            .join(format!("{}_mood.json", safe_id("session", sid)?)))
    }

    fn plan_path(&self, sid: &str, suffix: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join("plans")
            .join(format!("{}{suffix}.json", safe_id("session", sid)?)))
    }

    fn pattern_path(&self, sid: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join("patterns")
            .join(format!("{}.json", safe_id("session", sid)?)))
    }

    fn events_path(&self, sid: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join("events")
            .join(format!("{}.json", safe_id("session", sid)?)))
    }

    fn user_path(&self, uid: &str, file: &str) -> Result<PathBuf> {
        Ok(self.root.join("users").join(safe_id("user", uid)?).join(file))
    }

    // ── sessions & messages ────────────────────────────────────────────

    pub async fn session_exists(&self, sid: &str) -> Result<bool> {
        let _g = self.guard().await?;
        let index: SessionIndex = read_json(&self.sessions_path()).await?.unwrap_or_default();
        if index.contains_key(sid) {
            return Ok(true);
        }
        Ok(tokio::fs::try_exists(self.messages_path(sid)?).await?)
    }

    /// Owner of a registered session.
    pub async fn session_owner(&self, sid: &str) -> Result<Option<String>> {
        let _g = self.guard().await?;
        let index: SessionIndex = read_json(&self.sessions_path()).await?.unwrap_or_default();
        Ok(index.get(sid).map(|m| m.user_id.clone()))
    }

    /// Append a message, registering the session on first write. When
    /// `timestamp` is `None` the current time is used.
    pub async fn save_message(
        &self,
        sid: &str,
        user_id: &str,
        role: Role,
        content: &str,
        timestamp: Option<&str>,
    ) -> Result<ChatMessage> {
        let path = self.messages_path(sid)?;
        let _g = self.guard().await?;

        let message = ChatMessage::new(
            role,
            content,
            timestamp.map(str::to_string).unwrap_or_else(iso_now),
        );
        let mut messages: Vec<ChatMessage> = read_list(&path).await?;
        messages.push(message.clone());
        write_json(&path, &messages).await?;

        let mut index: SessionIndex = read_json(&self.sessions_path()).await?.unwrap_or_default();
        index
            .entry(sid.to_string())
            .and_modify(|m| m.updated_at = Utc::now())
            .or_insert_with(|| SessionMeta::new(user_id));
        write_json(&self.sessions_path(), &index).await?;

        Ok(message)
    }

    /// Messages of a session in insertion order; `limit` keeps the newest.
    pub async fn get_chat_history(&self, sid: &str, limit: Option<usize>) -> Result<Vec<ChatMessage>> {
        let path = self.messages_path(sid)?;
        let _g = self.guard().await?;
        Ok(last_n(read_list(&path).await?, limit))
    }

    pub async fn message_count(&self, sid: &str) -> Result<usize> {
        Ok(self.get_chat_history(sid, None).await?.len())
    }

    /// Sessions, newest activity first, optionally filtered by owner.
    pub async fn get_sessions(&self, user_id: Option<&str>) -> Result<Vec<SessionSummary>> {
        let _g = self.guard().await?;
        let index: SessionIndex = read_json(&self.sessions_path()).await?.unwrap_or_default();
        let mut sessions: Vec<SessionSummary> = index
            .into_iter()
            .filter(|(_, meta)| user_id.map_or(true, |u| meta.user_id == u))
            .map(|(session_id, meta)| SessionSummary {
                session_id,
                user_id: meta.user_id,
                created_at: meta.created_at,
                updated_at: meta.updated_at,
            })
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    pub async fn user_sessions(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self
            .get_sessions(Some(user_id))
            .await?
            .into_iter()
            .map(|s| s.session_id)
            .collect())
    }

    // ── mood ───────────────────────────────────────────────────────────

    pub async fn save_mood(&self, sid: &str, user_id: &str, analysis: MoodAnalysis) -> Result<MoodRecord> {
        let path = self.mood_path(sid)?;
        let _g = self.guard().await?;
        let mut records: Vec<MoodRecord> = read_list(&path).await?;
        let record = MoodRecord {
            id: format!("mood_{}", uuid::Uuid::now_v7().simple()),
            user_id: user_id.to_string(),
            analysis,
            created_at: iso_now(),
            updated_at: None,
        };
        records.push(record.clone());
        write_json(&path, &records).await?;
        Ok(record)
    }

    pub async fn get_moods(&self, sid: &str, limit: Option<usize>) -> Result<Vec<MoodRecord>> {
        let path = self.mood_path(sid)?;
        let _g = self.guard().await?;
        Ok(last_n(read_list(&path).await?, limit))
    }

    pub async fn update_mood(&self, sid: &str, mood_id: &str, analysis: MoodAnalysis) -> Result<MoodRecord> {
        let path = self.mood_path(sid)?;
        let _g = self.guard().await?;
        let mut records: Vec<MoodRecord> = read_list(&path).await?;
        let record = records
            .iter_mut()
            .find(|r| r.id == mood_id)
            .ok_or_else(|| ZhijiError::NotFound(format!("mood record {mood_id}")))?;
        record.analysis = analysis;
        record.updated_at = Some(iso_now());
        let updated = record.clone();
        write_json(&path, &records).await?;
        Ok(updated)
    }

    pub async fn delete_mood(&self, sid: &str, mood_id: &str) -> Result<()> {
        let path = self.mood_path(sid)?;
        let _g = self.guard().await?;
        let mut records: Vec<MoodRecord> = read_list(&path).await?;
        let before = records.len();
        records.retain(|r| r.id != mood_id);
        if records.len() == before {
            return Err(ZhijiError::NotFound(format!("mood record {mood_id}")));
        }
        write_json(&path, &records).await
    }

    // ── plans, inquiry, patterns ───────────────────────────────────────

    pub async fn get_plan(&self, sid: &str) -> Result<Option<Plan>> {
        let path = self.plan_path(sid, "")?;
        let _g = self.guard().await?;
        read_json(&path).await
    }

    pub async fn save_plan(&self, sid: &str, plan: &Plan) -> Result<()> {
        let path = self.plan_path(sid, "")?;
        let _g = self.guard().await?;
        write_json(&path, plan).await
    }

    /// Store the latest inquiry result and append it to the inquiry history.
    pub async fn save_inquiry<T: Serialize>(&self, sid: &str, result: &T) -> Result<()> {
        let latest = self.plan_path(sid, "_inquiry")?;
        let history_path = self.plan_path(sid, "_inquiry_history")?;
        let _g = self.guard().await?;

        let mut entry = serde_json::to_value(result)?;
        if let serde_json::Value::Object(ref mut map) = entry {
            map.insert("timestamp".into(), serde_json::Value::String(iso_now()));
        }
        write_json(&latest, &entry).await?;

        let mut history: Vec<serde_json::Value> = read_list(&history_path).await?;
        history.push(entry);
        write_json(&history_path, &history).await
    }

    pub async fn get_inquiry_history(&self, sid: &str) -> Result<Vec<serde_json::Value>> {
        let path = self.plan_path(sid, "_inquiry_history")?;
        let _g = self.guard().await?;
        read_list(&path).await
    }

    pub async fn save_pattern<T: Serialize>(&self, sid: &str, analysis: &T) -> Result<()> {
        let path = self.pattern_path(sid)?;
        let _g = self.guard().await?;
        write_json(&path, analysis).await
    }

    pub async fn get_pattern<T: DeserializeOwned>(&self, sid: &str) -> Result<Option<T>> {
        let path = self.pattern_path(sid)?;
        let _g = self.guard().await?;
        read_json(&path).await
    }

    // ── events ─────────────────────────────────────────────────────────

    pub async fn get_events(&self, sid: &str) -> Result<Vec<Event>> {
        let path = self.events_path(sid)?;
        let _g = self.guard().await?;
        read_list(&path).await
    }

    /// Append events, skipping ids already stored. Returns the new total.
    pub async fn append_events(&self, sid: &str, events: &[Event]) -> Result<usize> {
        let path = self.events_path(sid)?;
        let _g = self.guard().await?;
        let mut stored: Vec<Event> = read_list(&path).await?;
        for event in events {
            if !stored.iter().any(|e| e.id == event.id) {
                stored.push(event.clone());
            }
        }
        write_json(&path, &stored).await?;
        Ok(stored.len())
    }

    pub async fn find_event(&self, sid: &str, event_id: &str) -> Result<Option<Event>> {
        Ok(self
            .get_events(sid)
            .await?
            .into_iter()
            .find(|e| e.id == event_id))
    }

    pub async fn update_event(&self, sid: &str, event_id: &str, update: EventUpdate) -> Result<Event> {
        let path = self.events_path(sid)?;
        let _g = self.guard().await?;
        let mut stored: Vec<Event> = read_list(&path).await?;
        let event = stored
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or_else(|| ZhijiError::NotFound(format!("event {event_id}")))?;
        update.apply(event);
        let updated = event.clone();
        write_json(&path, &stored).await?;
        Ok(updated)
    }

    pub async fn delete_event(&self, sid: &str, event_id: &str) -> Result<()> {
        let path = self.events_path(sid)?;
        let _g = self.guard().await?;
        let mut stored: Vec<Event> = read_list(&path).await?;
        let before = stored.len();
        stored.retain(|e| e.id != event_id);
        if stored.len() == before {
            return Err(ZhijiError::NotFound(format!("event {event_id}")));
        }
        write_json(&path, &stored).await
    }

    // ── users ──────────────────────────────────────────────────────────

    pub async fn get_profile(&self, uid: &str) -> Result<UserProfile> {
        let path = self.user_path(uid, "profile.json")?;
        let _g = self.guard().await?;
        Ok(read_json(&path).await?.unwrap_or_default())
    }

    /// Read-modify-write the profile under the store lock.
    pub async fn update_profile<F>(&self, uid: &str, f: F) -> Result<UserProfile>
    where
        F: FnOnce(&mut UserProfile),
    {
        let path = self.user_path(uid, "profile.json")?;
        let _g = self.guard().await?;
        let mut profile: UserProfile = read_json(&path).await?.unwrap_or_default();
        f(&mut profile);
        write_json(&path, &profile).await?;
        Ok(profile)
    }

    pub async fn save_memory(&self, uid: &str, entry: MemoryEntry) -> Result<()> {
        let path = self.user_path(uid, "memory.json")?;
        let _g = self.guard().await?;
        let mut entries: Vec<MemoryEntry> = read_list(&path).await?;
        entries.push(entry);
        write_json(&path, &entries).await
    }

    /// Newest `limit` long-term memories, oldest first.
    pub async fn get_memories(&self, uid: &str, limit: Option<usize>) -> Result<Vec<MemoryEntry>> {
        let path = self.user_path(uid, "memory.json")?;
        let _g = self.guard().await?;
        Ok(last_n(read_list(&path).await?, limit))
    }

    /// Append an emotion sample; returns how many samples the user now has.
    pub async fn save_emotion(&self, uid: &str, record: EmotionRecord) -> Result<usize> {
        let path = self.user_path(uid, "emotions.json")?;
        let _g = self.guard().await?;
        let mut records: Vec<EmotionRecord> = read_list(&path).await?;
        records.push(record);
        write_json(&path, &records).await?;
        Ok(records.len())
    }

    pub async fn get_emotions(&self, uid: &str, limit: Option<usize>) -> Result<Vec<EmotionRecord>> {
        let path = self.user_path(uid, "emotions.json")?;
        let _g = self.guard().await?;
        Ok(last_n(read_list(&path).await?, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (JsonStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("zhiji-store-{}", uuid::Uuid::now_v7()));
        (JsonStore::new(&dir, 5), dir)
    }

    #[tokio::test]
    async fn test_message_roundtrip_preserves_fields() {
        let (store, dir) = temp_store();
        store
            .save_message("s1", "u1", Role::User, "我最近很累", Some("2024-03-01T09:00:00"))
            .await
            .unwrap();
        store
            .save_message("s1", "u1", Role::Agent, "听起来你压力很大", None)
            .await
            .unwrap();

        let history = store.get_chat_history("s1", None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].content, "我最近很累");
        assert_eq!(history[0].timestamp, "2024-03-01T09:00:00");
        assert_eq!(history[1].role, Role::Agent);
        assert!(!history[1].timestamp.is_empty());

        let last = store.get_chat_history("s1", Some(1)).await.unwrap();
        assert_eq!(last[0].content, "听起来你压力很大");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_session_exists_is_stable() {
        let (store, dir) = temp_store();
        assert!(!store.session_exists("s-new").await.unwrap());
        assert!(!store.session_exists("s-new").await.unwrap());

        store
            .save_message("s-new", "u1", Role::User, "hi", None)
            .await
            .unwrap();
        assert!(store.session_exists("s-new").await.unwrap());
        assert!(store.session_exists("s-new").await.unwrap());
        assert_eq!(
            store.session_owner("s-new").await.unwrap().as_deref(),
            Some("u1")
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_sessions_filtered_by_user() {
        let (store, dir) = temp_store();
        store.save_message("a", "alice", Role::User, "1", None).await.unwrap();
        store.save_message("b", "bob", Role::User, "2", None).await.unwrap();
        store.save_message("c", "alice", Role::User, "3", None).await.unwrap();

        let mut alice = store.user_sessions("alice").await.unwrap();
        alice.sort();
        assert_eq!(alice, vec!["a", "c"]);
        assert_eq!(store.get_sessions(None).await.unwrap().len(), 3);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let (store, _dir) = temp_store();
        let err = store.get_chat_history("../etc", None).await.unwrap_err();
        assert!(matches!(err, ZhijiError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_mood_crud() {
        let (store, dir) = temp_store();
        let rec = store
            .save_mood("s1", "u1", MoodAnalysis::default())
            .await
            .unwrap();
        assert_eq!(store.get_moods("s1", None).await.unwrap().len(), 1);

        let updated = store
            .update_mood(
                "s1",
                &rec.id,
                MoodAnalysis {
                    mood_intensity: 7.0,
                    mood_category: "焦虑".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.analysis.mood_category, "焦虑");
        assert!(updated.updated_at.is_some());

        store.delete_mood("s1", &rec.id).await.unwrap();
        assert!(store.get_moods("s1", None).await.unwrap().is_empty());
        assert!(matches!(
            store.delete_mood("s1", &rec.id).await,
            Err(ZhijiError::NotFound(_))
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_event_crud() {
        let (store, dir) = temp_store();
        let event: Event = serde_json::from_value(serde_json::json!({
            "id": "evt_1", "primaryType": "physiological", "subType": "sleepIssues",
            "title": "失眠", "content": "凌晨三点醒来"
        }))
        .unwrap();

        assert_eq!(store.append_events("s1", &[event.clone()]).await.unwrap(), 1);
        // same id is not duplicated
        assert_eq!(store.append_events("s1", &[event]).await.unwrap(), 1);

        let updated = store
            .update_event(
                "s1",
                "evt_1",
                EventUpdate {
                    status: Some("done".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, "done");
        assert_eq!(
            store.find_event("s1", "evt_1").await.unwrap().unwrap().status,
            "done"
        );

        store.delete_event("s1", "evt_1").await.unwrap();
        assert!(store.find_event("s1", "evt_1").await.unwrap().is_none());
        assert!(matches!(
            store.update_event("s1", "evt_1", EventUpdate::default()).await,
            Err(ZhijiError::NotFound(_))
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_user_profile_memory_and_emotions() {
        let (store, dir) = temp_store();
        store
            .update_profile("u1", |p| p.recent_emotion = Some("happy".into()))
            .await
            .unwrap();
        assert_eq!(
            store.get_profile("u1").await.unwrap().recent_emotion.as_deref(),
            Some("happy")
        );

        for i in 0..7 {
            store
                .save_memory("u1", MemoryEntry::new(format!("m{i}"), None))
                .await
                .unwrap();
        }
        let recent = store.get_memories("u1", Some(5)).await.unwrap();
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].content, "m2");
        assert_eq!(recent[4].content, "m6");

        let record = EmotionRecord {
            score: 0.4,
            emotion: "neutral".into(),
            session_id: "s1".into(),
            timestamp: iso_now(),
        };
        assert_eq!(store.save_emotion("u1", record.clone()).await.unwrap(), 1);
        assert_eq!(store.save_emotion("u1", record).await.unwrap(), 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_plan_and_inquiry_history() {
        let (store, dir) = temp_store();
        assert!(store.get_plan("s1").await.unwrap().is_none());
        let plan = Plan::new_default();
        store.save_plan("s1", &plan).await.unwrap();
        assert_eq!(store.get_plan("s1").await.unwrap().unwrap(), plan);

        store
            .save_inquiry("s1", &serde_json::json!({"current_stage": "基础情况了解"}))
            .await
            .unwrap();
        store
            .save_inquiry("s1", &serde_json::json!({"current_stage": "信息充分"}))
            .await
            .unwrap();
        let history = store.get_inquiry_history("s1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[1]["timestamp"].is_string());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
