//! Live session record and the state store shared by client and transport

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use crate::protocol::{
    AgentCapabilities, AvailableCommand, InitializeResponse, ModelInfo, SessionConfigOption,
    SessionId, SessionMode, SessionSetup, SessionUpdate,
};

/// The one conversation a connected client holds with its agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub cwd: PathBuf,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
    pub current_mode_id: Option<String>,
    pub current_model_id: Option<String>,
    pub available_modes: Vec<SessionMode>,
    pub available_models: Vec<ModelInfo>,
    pub config_options: Vec<SessionConfigOption>,
    pub available_commands: Vec<AvailableCommand>,
    pub title: Option<String>,
    pub updated_at: Option<String>,
}

impl Session {
    /// Create an active session from the agent's setup response
    pub fn new(id: SessionId, cwd: PathBuf, setup: SessionSetup) -> Self {
        let mut session = Self {
            id,
            cwd,
            created_at: Utc::now(),
            is_active: true,
            current_mode_id: None,
            current_model_id: None,
            available_modes: Vec::new(),
            available_models: Vec::new(),
            config_options: Vec::new(),
            available_commands: Vec::new(),
            title: None,
            updated_at: None,
        };
        session.apply_setup(setup);
        session
    }

    /// Rebuild a loaded or resumed session
    ///
    /// The replayed history is folded first; the setup in the agent's answer
    /// is newer and wins where both describe the same field.
    pub fn restore(
        id: SessionId,
        cwd: PathBuf,
        replayed: &[SessionUpdate],
        setup: SessionSetup,
    ) -> Self {
        let mut session = Self::new(id, cwd, SessionSetup::default());
        for update in replayed {
            session.apply_update(update);
        }
        session.apply_setup(setup);
        session
    }

    fn apply_setup(&mut self, setup: SessionSetup) {
        if let Some(modes) = setup.modes {
            self.current_mode_id = Some(modes.current_mode_id);
            self.available_modes = modes.available_modes;
        }
        if let Some(models) = setup.models {
            self.current_model_id = Some(models.current_model_id);
            self.available_models = models.available_models;
        }
        if let Some(options) = setup.config_options {
            self.config_options = options;
        }
    }

    /// Fold a `session/update` into the session record
    ///
    /// Only the variants that describe session state are applied; message
    /// chunks, tool calls and plans belong to the event stream.
    pub fn apply_update(&mut self, update: &SessionUpdate) {
        match update {
            SessionUpdate::CurrentModeUpdate(update) => {
                self.current_mode_id = Some(update.current_mode_id.clone());
            }
            SessionUpdate::ConfigOptionUpdate(update) => {
                self.config_options = update.config_options.clone();
            }
            SessionUpdate::AvailableCommandsUpdate(update) => {
                self.available_commands = update.available_commands.clone();
            }
            SessionUpdate::SessionInfoUpdate(info) => {
                if let Some(title) = &info.title {
                    self.title = Some(title.clone());
                }
                if let Some(updated_at) = &info.updated_at {
                    self.updated_at = Some(updated_at.clone());
                }
            }
            SessionUpdate::UserMessageChunk(_)
            | SessionUpdate::AgentMessageChunk(_)
            | SessionUpdate::AgentThoughtChunk(_)
            | SessionUpdate::ToolCall(_)
            | SessionUpdate::ToolCallUpdate(_)
            | SessionUpdate::Plan(_) => {}
        }
    }
}

/// A session being loaded or resumed, and the history replayed for it so far
#[derive(Debug)]
struct PendingSession {
    id: SessionId,
    replayed: Vec<SessionUpdate>,
}

#[derive(Debug, Default)]
struct StateInner {
    session: Option<Session>,
    agent: Option<InitializeResponse>,
    pending: Option<PendingSession>,
}

/// Session and negotiated capabilities of one client
///
/// Getters never fail: a poisoned lock is recovered since the stored values
/// are plain data.
#[derive(Debug, Default)]
pub struct SessionState {
    inner: RwLock<StateInner>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> Option<Session> {
        self.read(|inner| inner.session.clone())
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.read(|inner| inner.session.as_ref().map(|s| s.id.clone()))
    }

    pub fn agent_capabilities(&self) -> Option<AgentCapabilities> {
        self.read(|inner| inner.agent.as_ref().map(|a| a.agent_capabilities.clone()))
    }

    pub fn agent_info(&self) -> Option<InitializeResponse> {
        self.read(|inner| inner.agent.clone())
    }

    pub fn is_active(&self) -> bool {
        self.read(|inner| inner.session.as_ref().is_some_and(|s| s.is_active))
    }

    pub fn set_agent(&self, agent: InitializeResponse) {
        self.write(|inner| inner.agent = Some(agent));
    }

    pub fn set_session(&self, session: Session) {
        tracing::info!("Session {} active in {}", session.id, session.cwd.display());
        self.write(|inner| inner.session = Some(session));
    }

    /// Apply a change to the live session; no-op without one
    pub fn update_session(&self, f: impl FnOnce(&mut Session)) {
        self.write(|inner| {
            if let Some(session) = inner.session.as_mut() {
                f(session);
            }
        });
    }

    /// Accept updates for `id` until [`finish_pending`](Self::finish_pending)
    pub fn begin_pending(&self, id: SessionId) {
        self.write(|inner| {
            inner.pending = Some(PendingSession {
                id,
                replayed: Vec::new(),
            })
        });
    }

    /// Stop accepting updates for the pending session; returns its history
    pub fn finish_pending(&self) -> Vec<SessionUpdate> {
        self.write(|inner| inner.pending.take())
            .map(|pending| pending.replayed)
            .unwrap_or_default()
    }

    /// Whether an update or request for `session_id` belongs to this client
    ///
    /// Updates may arrive before the first session is stored, so only a
    /// conflicting id is rejected.
    pub fn accepts(&self, session_id: &str) -> bool {
        self.read(|inner| {
            inner.pending.as_ref().is_some_and(|p| p.id == session_id)
                || inner.session.as_ref().map_or(true, |s| s.id == session_id)
        })
    }

    /// Record an update for the pending session, or fold it into the live one
    pub fn record_update(&self, session_id: &str, update: &SessionUpdate) {
        self.write(|inner| {
            if let Some(pending) = inner.pending.as_mut().filter(|p| p.id == session_id) {
                pending.replayed.push(update.clone());
            } else if let Some(session) = inner.session.as_mut() {
                session.apply_update(update);
            }
        });
    }

    /// Keep the record but flag it inactive after transport loss
    pub fn mark_inactive(&self) {
        self.update_session(|session| session.is_active = false);
    }

    /// Drop session and capabilities
    pub fn clear(&self) {
        self.write(|inner| {
            inner.session = None;
            inner.agent = None;
            inner.pending = None;
        });
    }

    fn read<T>(&self, f: impl FnOnce(&StateInner) -> T) -> T {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut StateInner) -> T) -> T {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        ConfigOptionUpdate, CurrentModeUpdate, SessionInfoUpdate, SessionModeState,
    };

    fn setup_with_modes() -> SessionSetup {
        SessionSetup {
            modes: Some(SessionModeState {
                current_mode_id: "code".to_string(),
                available_modes: vec![
                    SessionMode {
                        id: "code".to_string(),
                        name: "Code".to_string(),
                        description: None,
                    },
                    SessionMode {
                        id: "plan".to_string(),
                        name: "Plan".to_string(),
                        description: None,
                    },
                ],
            }),
            models: None,
            config_options: None,
        }
    }

    #[test]
    fn test_session_new_applies_setup() {
        let session = Session::new("s1".into(), PathBuf::from("/tmp/proj"), setup_with_modes());
        assert!(session.is_active);
        assert_eq!(session.cwd, PathBuf::from("/tmp/proj"));
        assert_eq!(session.current_mode_id.as_deref(), Some("code"));
        assert_eq!(session.available_modes.len(), 2);
        assert!(session.available_models.is_empty());
    }

    #[test]
    fn test_apply_state_updates() {
        let mut session = Session::new("s1".into(), PathBuf::from("/tmp"), SessionSetup::default());

        session.apply_update(&SessionUpdate::CurrentModeUpdate(CurrentModeUpdate {
            current_mode_id: "plan".to_string(),
        }));
        session.apply_update(&SessionUpdate::ConfigOptionUpdate(ConfigOptionUpdate {
            config_options: vec![],
        }));
        session.apply_update(&SessionUpdate::SessionInfoUpdate(SessionInfoUpdate {
            title: Some("Fix bug".to_string()),
            updated_at: None,
        }));

        assert_eq!(session.current_mode_id.as_deref(), Some("plan"));
        assert_eq!(session.title.as_deref(), Some("Fix bug"));
        assert!(session.updated_at.is_none());
    }

    #[test]
    fn test_state_lifecycle() {
        let state = SessionState::new();
        assert!(state.session().is_none());
        assert!(state.agent_capabilities().is_none());
        assert!(!state.is_active());

        state.set_session(Session::new("s1".into(), PathBuf::from("/tmp"), SessionSetup::default()));
        assert!(state.is_active());
        assert_eq!(state.session_id().as_deref(), Some("s1"));

        state.mark_inactive();
        assert!(!state.is_active());
        assert!(state.session().is_some());

        state.clear();
        assert!(state.session().is_none());
    }

    #[test]
    fn test_pending_session_collects_replayed_history() {
        let state = SessionState::new();
        state.set_session(Session::new("s1".into(), PathBuf::from("/tmp"), SessionSetup::default()));
        assert!(!state.accepts("old-1"));

        state.begin_pending("old-1".into());
        assert!(state.accepts("old-1"));
        assert!(state.accepts("s1"));
        let plan = SessionUpdate::CurrentModeUpdate(CurrentModeUpdate {
            current_mode_id: "plan".to_string(),
        });
        state.record_update("old-1", &plan);
        assert_eq!(state.session().unwrap().current_mode_id, None);

        let replayed = state.finish_pending();
        assert_eq!(replayed, vec![plan]);
        assert!(!state.accepts("old-1"));
        assert!(state.finish_pending().is_empty());

        let restored = Session::restore(
            "old-1".into(),
            PathBuf::from("/tmp"),
            &replayed,
            SessionSetup::default(),
        );
        assert_eq!(restored.current_mode_id.as_deref(), Some("plan"));

        let restored = Session::restore("old-1".into(), PathBuf::from("/tmp"), &replayed, setup_with_modes());
        assert_eq!(restored.current_mode_id.as_deref(), Some("code"));
    }
}
