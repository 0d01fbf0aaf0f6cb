use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use kubepanel_types::{
    DisplayPreferences, LogSource, Panel, PanelFactory, PreferencesStore, StreamError,
    StreamOptions, StreamTarget,
};

use crate::session::{LogStreamSession, SessionConfig};

/// A live panel and the session feeding it
struct PanelEntry {
    panel: Arc<dyn Panel>,
    session: LogStreamSession,
}

/// At most one log panel per cluster context
///
/// Owned by whoever owns the extension's activation scope and passed to call
/// sites explicitly; dropping it disposes every panel.
pub struct PanelRegistry {
    entries: HashMap<String, PanelEntry>,
    panels: Arc<dyn PanelFactory>,
    source: Arc<dyn LogSource>,
    preferences: Arc<dyn PreferencesStore>,
    config: SessionConfig,
}

impl PanelRegistry {
    pub fn new(
        panels: Arc<dyn PanelFactory>,
        source: Arc<dyn LogSource>,
        preferences: Arc<dyn PreferencesStore>,
        config: SessionConfig,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        Ok(Self {
            entries: HashMap::new(),
            panels,
            source,
            preferences,
            config,
        })
    }

    /// Show logs for `target` in the panel for `context`
    ///
    /// An existing panel is revealed and retargeted; otherwise a panel and
    /// session are created, wired together, then started.
    pub fn open_or_reveal(&mut self, context: &str, target: StreamTarget) -> Result<(), StreamError> {
        if target.context != context {
            return Err(StreamError::Configuration(format!(
                "target context '{}' does not match panel context '{}'",
                target.context, context
            )));
        }
        target.validate()?;
        let options = StreamOptions::from(&self.preferences.load(context));

        if let Some(entry) = self.entries.get_mut(context) {
            debug!(context, stream = %target, "revealing existing log panel");
            entry.panel.reveal();
            return entry.session.retarget(target, options);
        }

        let panel = self.panels.create_panel(context);
        let mut session = LogStreamSession::new(
            Arc::clone(&panel),
            Arc::clone(&self.source),
            self.config.clone(),
        )?;
        if let Err(err) = session.start(target, options) {
            session.dispose();
            panel.dispose();
            return Err(err);
        }

        info!(context, "opened log panel");
        self.entries
            .insert(context.to_string(), PanelEntry { panel, session });
        Ok(())
    }

    /// Dispose the panel for `context`; unknown contexts are ignored
    pub fn dispose(&mut self, context: &str) {
        if let Some(mut entry) = self.entries.remove(context) {
            entry.session.dispose();
            entry.panel.dispose();
            info!(context, "disposed log panel");
        }
    }

    /// The host already closed the panel; release the session only
    pub fn panel_closed(&mut self, context: &str) {
        if let Some(mut entry) = self.entries.remove(context) {
            entry.session.dispose();
            debug!(context, "log panel closed by host");
        }
    }

    /// Dispose every panel (extension deactivation)
    pub fn dispose_all(&mut self) {
        for (context, mut entry) in self.entries.drain() {
            entry.session.dispose();
            entry.panel.dispose();
            debug!(context, "disposed log panel");
        }
    }

    /// User-triggered retry of the context's current target
    pub fn retry(&mut self, context: &str) -> Result<(), StreamError> {
        match self.entries.get_mut(context) {
            Some(entry) => entry.session.restart(),
            None => Ok(()),
        }
    }

    /// User "clear display"
    pub fn clear(&self, context: &str) {
        if let Some(entry) = self.entries.get(context) {
            entry.session.clear();
        }
    }

    /// Persist new preferences and restart the stream with them
    pub fn update_preferences(
        &mut self,
        context: &str,
        prefs: DisplayPreferences,
    ) -> Result<(), StreamError> {
        if let Err(e) = self.preferences.save(context, &prefs) {
            warn!(context, error = %e, "failed to persist display preferences");
        }

        let Some(entry) = self.entries.get_mut(context) else {
            return Ok(());
        };
        let Some(target) = entry.session.target().cloned() else {
            return Ok(());
        };
        entry.session.retarget(target, StreamOptions::from(&prefs))
    }

    pub fn session(&self, context: &str) -> Option<&LogStreamSession> {
        self.entries.get(context).map(|entry| &entry.session)
    }

    pub fn contains(&self, context: &str) -> bool {
        self.entries.contains_key(context)
    }

    pub fn contexts(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for PanelRegistry {
    fn drop(&mut self) {
        self.dispose_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preferences::MemoryPreferencesStore;
    use crate::retry::RetryPolicy;
    use crate::session::SessionState;
    use crate::testing::{RecordingPanelFactory, ScriptedSource, settle, wait_until};
    use std::time::Duration;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            buffer_capacity: 100,
            flush_interval: Duration::from_millis(20),
            retry: RetryPolicy::immediate(5),
        }
    }

    fn registry_with(
        preferences: MemoryPreferencesStore,
    ) -> (
        PanelRegistry,
        Arc<RecordingPanelFactory>,
        Arc<ScriptedSource>,
        Arc<MemoryPreferencesStore>,
    ) {
        let factory = RecordingPanelFactory::new();
        let source = ScriptedSource::new();
        let preferences = Arc::new(preferences);
        let registry = PanelRegistry::new(
            factory.clone(),
            source.clone(),
            preferences.clone(),
            fast_config(),
        )
        .unwrap();
        (registry, factory, source, preferences)
    }

    fn pod(context: &str, name: &str) -> StreamTarget {
        StreamTarget::new(context, "default", name)
    }

    #[tokio::test]
    async fn test_reopen_reveals_and_retargets() {
        let (mut registry, factory, source, _) = registry_with(MemoryPreferencesStore::new());
        let _x = source.push_stream();
        let _y = source.push_stream();

        registry.open_or_reveal("ctx1", pod("ctx1", "pod-x")).unwrap();
        wait_until(|| source.live() == 1).await;
        registry.open_or_reveal("ctx1", pod("ctx1", "pod-y")).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(factory.created(), 1);
        assert_eq!(factory.panel(0).reveals(), 1);
        assert_eq!(
            registry.session("ctx1").and_then(|s| s.target()),
            Some(&pod("ctx1", "pod-y"))
        );

        wait_until(|| source.opens() == 2 && source.live() == 1).await;
    }

    #[tokio::test]
    async fn test_repeated_opens_keep_one_entry() {
        let (mut registry, factory, source, _) = registry_with(MemoryPreferencesStore::new());
        let _feeds: Vec<_> = (0..5).map(|_| source.push_stream()).collect();

        for n in 0..5 {
            registry
                .open_or_reveal("ctx1", pod("ctx1", &format!("web-{}", n)))
                .unwrap();
            assert_eq!(registry.len(), 1);
        }

        assert_eq!(factory.created(), 1);
        assert_eq!(
            registry.session("ctx1").and_then(|s| s.target()),
            Some(&pod("ctx1", "web-4"))
        );
        wait_until(|| source.live() == 1).await;
    }

    #[tokio::test]
    async fn test_contexts_get_separate_panels() {
        let (mut registry, factory, source, _) = registry_with(MemoryPreferencesStore::new());
        let _a = source.push_stream();
        let _b = source.push_stream();

        registry.open_or_reveal("dev", pod("dev", "api-0")).unwrap();
        registry.open_or_reveal("prod", pod("prod", "api-0")).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(factory.contexts(), vec!["dev", "prod"]);
        let mut contexts = registry.contexts();
        contexts.sort();
        assert_eq!(contexts, vec!["dev", "prod"]);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (mut registry, factory, source, _) = registry_with(MemoryPreferencesStore::new());
        let _feed = source.push_stream();

        registry.open_or_reveal("ctx1", pod("ctx1", "web-0")).unwrap();
        wait_until(|| source.live() == 1).await;

        registry.dispose("ctx1");
        registry.dispose("ctx1");
        registry.dispose("never-opened");

        assert!(!registry.contains("ctx1"));
        assert!(registry.is_empty());
        assert_eq!(factory.panel(0).disposals(), 1);
        wait_until(|| source.live() == 0).await;
    }

    #[tokio::test]
    async fn test_host_close_does_not_dispose_panel_again() {
        let (mut registry, factory, source, _) = registry_with(MemoryPreferencesStore::new());
        let _feed = source.push_stream();

        registry.open_or_reveal("ctx1", pod("ctx1", "web-0")).unwrap();
        registry.panel_closed("ctx1");

        assert!(registry.is_empty());
        assert_eq!(factory.panel(0).disposals(), 0);
        wait_until(|| source.live() == 0).await;
    }

    #[tokio::test]
    async fn test_reopen_after_dispose_creates_new_panel() {
        let (mut registry, factory, source, _) = registry_with(MemoryPreferencesStore::new());
        let _first = source.push_stream();
        let _second = source.push_stream();

        registry.open_or_reveal("ctx1", pod("ctx1", "web-0")).unwrap();
        registry.dispose("ctx1");
        registry.open_or_reveal("ctx1", pod("ctx1", "web-0")).unwrap();

        assert_eq!(factory.created(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_stream_options_come_from_preferences() {
        let prefs = DisplayPreferences {
            follow: false,
            timestamps: true,
            line_limit: 20,
            show_previous: true,
        };
        let (mut registry, _, source, _) =
            registry_with(MemoryPreferencesStore::with_context("ctx1", prefs));
        let _feed = source.push_stream();

        registry.open_or_reveal("ctx1", pod("ctx1", "web-0")).unwrap();
        wait_until(|| source.opens() == 1).await;

        let (_, options) = &source.opened()[0];
        assert!(!options.follow);
        assert!(options.timestamps);
        assert!(options.previous);
        assert_eq!(options.tail_lines, Some(20));
    }

    #[tokio::test]
    async fn test_update_preferences_persists_and_restarts() {
        let (mut registry, _, source, preferences) =
            registry_with(MemoryPreferencesStore::new());
        let _first = source.push_stream();
        let _second = source.push_stream();

        registry.open_or_reveal("ctx1", pod("ctx1", "web-0")).unwrap();
        wait_until(|| source.opens() == 1).await;
        let prefs = DisplayPreferences {
            timestamps: true,
            ..Default::default()
        };
        registry.update_preferences("ctx1", prefs.clone()).unwrap();

        wait_until(|| source.opens() == 2).await;
        assert_eq!(preferences.load("ctx1"), prefs);
        assert!(source.opened()[1].1.timestamps);
        assert_eq!(source.opened()[1].0, pod("ctx1", "web-0"));
    }

    #[tokio::test]
    async fn test_retry_restarts_failed_session() {
        let (mut registry, _, source, _) = registry_with(MemoryPreferencesStore::new());
        source.push_failure(StreamError::connection(&pod("ctx1", "web-0"), "pod not found"));
        let _feed = source.push_stream();

        registry.open_or_reveal("ctx1", pod("ctx1", "web-0")).unwrap();
        wait_until(|| {
            registry.session("ctx1").map(|s| s.state()) == Some(SessionState::Error)
        })
        .await;

        registry.retry("ctx1").unwrap();
        wait_until(|| {
            registry.session("ctx1").map(|s| s.state()) == Some(SessionState::Connected)
        })
        .await;
        registry.retry("unknown").unwrap();
    }

    #[tokio::test]
    async fn test_clear_empties_session_history() {
        let (mut registry, _, source, _) = registry_with(MemoryPreferencesStore::new());
        let feed = source.push_stream();

        registry.open_or_reveal("ctx1", pod("ctx1", "web-0")).unwrap();
        feed.line("hello");
        wait_until(|| registry.session("ctx1").map(|s| s.buffer().len()) == Some(1)).await;

        registry.clear("ctx1");
        assert_eq!(registry.session("ctx1").map(|s| s.buffer().len()), Some(0));
    }

    #[tokio::test]
    async fn test_mismatched_context_is_rejected() {
        let (mut registry, factory, _, _) = registry_with(MemoryPreferencesStore::new());

        let result = registry.open_or_reveal("ctx1", pod("ctx2", "web-0"));
        assert!(matches!(result, Err(StreamError::Configuration(_))));
        assert!(registry.is_empty());
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn test_dispose_all_releases_everything() {
        let (mut registry, factory, source, _) = registry_with(MemoryPreferencesStore::new());
        let _a = source.push_stream();
        let _b = source.push_stream();

        registry.open_or_reveal("dev", pod("dev", "web-0")).unwrap();
        registry.open_or_reveal("prod", pod("prod", "web-0")).unwrap();
        registry.dispose_all();

        assert!(registry.is_empty());
        assert_eq!(factory.panel(0).disposals(), 1);
        assert_eq!(factory.panel(1).disposals(), 1);
        settle().await;
        assert_eq!(source.live(), 0);
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let result = PanelRegistry::new(
            RecordingPanelFactory::new(),
            ScriptedSource::new(),
            Arc::new(MemoryPreferencesStore::new()),
            SessionConfig {
                buffer_capacity: 0,
                ..SessionConfig::default()
            },
        );
        assert!(matches!(result, Err(StreamError::Configuration(_))));
    }
}
