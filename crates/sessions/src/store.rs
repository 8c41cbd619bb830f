//! The session store.
//!
//! Persists session state in `sessions.json` under the configured state
//! path. All mutation goes through atomic update methods; the lock is
//! held for the duration of each update so token counters and turn
//! appends never interleave. A single session's turns are strictly
//! serial — the engine guarantees turn N+1 does not start before turn N
//! reaches a terminal state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;

use tess_domain::error::{Error, Result};

use crate::types::{SessionKey, SessionMessage, SessionRecord, TurnRecord};

/// JSON-file-backed session store.
pub struct SessionStore {
    sessions_path: PathBuf,
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionStore {
    /// Load or create the store at `state_path/sessions/sessions.json`.
    pub fn new(state_path: &Path) -> Result<Self> {
        let dir = state_path.join("sessions");
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;

        let sessions_path = dir.join("sessions.json");
        let sessions = if sessions_path.exists() {
            let raw = std::fs::read_to_string(&sessions_path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        tracing::info!(
            sessions = sessions.len(),
            path = %sessions_path.display(),
            "session store loaded"
        );

        Ok(Self {
            sessions_path,
            sessions: RwLock::new(sessions),
        })
    }

    /// Look up a session.
    pub fn get(&self, key: &SessionKey) -> Option<SessionRecord> {
        self.sessions.read().get(&key.flat()).cloned()
    }

    /// Resolve or create a session. Returns `(record, is_new)`.
    pub fn resolve_or_create(&self, key: &SessionKey) -> (SessionRecord, bool) {
        {
            let sessions = self.sessions.read();
            if let Some(record) = sessions.get(&key.flat()) {
                return (record.clone(), false);
            }
        }

        let now = Utc::now();
        let record = SessionRecord {
            user_id: key.user_id.clone(),
            session_id: key.session_id.clone(),
            name: String::new(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            turns: Vec::new(),
            profile_tags_used: Vec::new(),
            models_used: Vec::new(),
        };

        let mut sessions = self.sessions.write();
        // Double-checked: another caller may have raced us here.
        if let Some(existing) = sessions.get(&key.flat()) {
            return (existing.clone(), false);
        }
        sessions.insert(key.flat(), record.clone());
        (record, true)
    }

    /// Append a message to the conversation history.
    pub fn append_message(
        &self,
        key: &SessionKey,
        role: &str,
        text: &str,
        rich: Option<Value>,
    ) {
        let mut sessions = self.sessions.write();
        if let Some(record) = sessions.get_mut(&key.flat()) {
            record.messages.push(SessionMessage {
                role: role.to_string(),
                text: text.to_string(),
                rich,
                timestamp: Utc::now(),
            });
            record.updated_at = Utc::now();
        }
    }

    /// Add token and cost usage to the session counters.
    pub fn add_tokens(&self, key: &SessionKey, input: u64, output: u64, cost_usd: f64) {
        let mut sessions = self.sessions.write();
        if let Some(record) = sessions.get_mut(&key.flat()) {
            record.input_tokens += input;
            record.output_tokens += output;
            record.cost_usd += cost_usd;
            record.updated_at = Utc::now();
        }
    }

    /// Append a completed (or partial) turn to the workflow history and
    /// record the profile tag and model used.
    pub fn append_turn(&self, key: &SessionKey, turn: TurnRecord) {
        let mut sessions = self.sessions.write();
        if let Some(record) = sessions.get_mut(&key.flat()) {
            if !record.profile_tags_used.contains(&turn.profile_tag) {
                record.profile_tags_used.push(turn.profile_tag.clone());
            }
            if !record.models_used.contains(&turn.model) {
                record.models_used.push(turn.model.clone());
            }
            record.turns.push(turn);
            record.updated_at = Utc::now();
        }
    }

    /// Rename a session.
    pub fn update_name(&self, key: &SessionKey, name: &str) {
        let mut sessions = self.sessions.write();
        if let Some(record) = sessions.get_mut(&key.flat()) {
            record.name = name.to_string();
            record.updated_at = Utc::now();
        }
    }

    /// The cumulative `(input, output, cost)` counters.
    pub fn totals(&self, key: &SessionKey) -> (u64, u64, f64) {
        self.sessions
            .read()
            .get(&key.flat())
            .map(|r| (r.input_tokens, r.output_tokens, r.cost_usd))
            .unwrap_or((0, 0, 0.0))
    }

    /// All sessions, most recently updated first.
    pub fn list(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> = self.sessions.read().values().cloned().collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        records
    }

    /// Write the store to disk (atomic rename).
    pub fn flush(&self) -> Result<()> {
        let snapshot = {
            let sessions = self.sessions.read();
            serde_json::to_string_pretty(&*sessions)?
        };
        let tmp = self.sessions_path.with_extension("json.tmp");
        std::fs::write(&tmp, snapshot).map_err(Error::Io)?;
        std::fs::rename(&tmp, &self.sessions_path).map_err(Error::Io)?;
        Ok(())
    }
}
