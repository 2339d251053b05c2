//! Session registry - composes discovery, tmux, and the terminal bridge
//! into the views served over the API.
//!
//! The registry owns no caches of its own; freshness is exactly the
//! composition of discovery's event-driven map and the tmux manager's
//! short-lived window cache.

use std::collections::HashMap;
use std::sync::Arc;

use relay_core::{ProjectGroup, SessionId, SessionMeta, SessionView, TmuxStatus};

use crate::discovery::DiscoveryService;
use crate::tmux::{ConnectionWatch, TmuxManager, TmuxWindow};

pub struct SessionRegistry {
    discovery: Arc<DiscoveryService>,
    tmux: Arc<TmuxManager>,
    connections: Arc<dyn ConnectionWatch>,
}

impl SessionRegistry {
    pub fn new(
        discovery: Arc<DiscoveryService>,
        tmux: Arc<TmuxManager>,
        connections: Arc<dyn ConnectionWatch>,
    ) -> Self {
        Self {
            discovery,
            tmux,
            connections,
        }
    }

    /// All sessions as views, newest first.
    ///
    /// Takes one window snapshot up front so every view in the batch
    /// reflects the same instant.
    pub async fn list_sessions(&self) -> Vec<SessionView> {
        let windows = self.window_snapshot().await;
        self.discovery
            .get_all()
            .into_iter()
            .map(|meta| self.build_view(meta, &windows))
            .collect()
    }

    /// One session as a view.
    pub async fn get_session(&self, id: &SessionId) -> Option<SessionView> {
        let meta = self.discovery.get(id)?;
        let windows = self.window_snapshot().await;
        Some(self.build_view(meta, &windows))
    }

    /// Whether discovery knows this session.
    pub fn has_session(&self, id: &SessionId) -> bool {
        self.discovery.contains(id)
    }

    /// The project path recorded for a session.
    pub fn project_path_of(&self, id: &SessionId) -> Option<String> {
        self.discovery.get(id).map(|meta| meta.project_path)
    }

    /// Per-project summaries, most recently active project first.
    pub fn grouped_by_project(&self) -> Vec<ProjectGroup> {
        let mut groups: Vec<ProjectGroup> = self
            .discovery
            .get_by_project()
            .into_iter()
            .filter_map(|(project_path, sessions)| {
                // Lists are newest-first, so the head carries the group's
                // latest timestamp
                let latest = sessions.first()?.timestamp;
                Some(ProjectGroup {
                    project_name: ProjectGroup::name_for_path(&project_path),
                    project_path,
                    session_count: sessions.len(),
                    latest_timestamp: latest,
                })
            })
            .collect();

        groups.sort_by(|a, b| b.latest_timestamp.cmp(&a.latest_timestamp));
        groups
    }

    async fn window_snapshot(&self) -> HashMap<SessionId, TmuxWindow> {
        self.tmux.list_owned().await.into_iter().collect()
    }

    fn build_view(
        &self,
        meta: SessionMeta,
        windows: &HashMap<SessionId, TmuxWindow>,
    ) -> SessionView {
        let tmux_status = match windows.get(&meta.id) {
            Some(window) if window.attached => TmuxStatus::Active,
            Some(_) => TmuxStatus::Detached,
            None => TmuxStatus::None,
        };
        let has_active_connection = self.connections.is_connected(&meta.id);
        SessionView::build(meta, tmux_status, has_active_connection)
    }
}

// ============================================================================
// Tests
// ============================================================================
