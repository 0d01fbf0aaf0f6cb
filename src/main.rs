use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use kubepanel_k8s::{KubeClient, KubeLogSource};
use kubepanel_logs::{
    DisplayPreferences, MemoryPreferencesStore, PanelRegistry, PreferencesStore, SessionState,
    StreamTarget, TomlPreferencesStore,
};

mod config;
mod panel;

use config::Config;
use panel::TerminalPanelFactory;

/// Kubepanel - Stream Kubernetes pod logs into a per-cluster log panel
#[derive(Parser, Debug)]
#[command(name = "kubepanel")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Kubernetes context name
    #[arg(value_name = "CONTEXT")]
    context: String,

    /// Namespace of the pod
    #[arg(value_name = "NAMESPACE")]
    namespace: String,

    /// Pod name
    #[arg(value_name = "POD")]
    pod: String,

    /// Only stream this container (default: all containers)
    #[arg(long, short = 'c')]
    container: Option<String>,

    /// Number of historical log lines to fetch (0 = all)
    #[arg(long)]
    tail_lines: Option<i64>,

    /// Ask the API server to prefix each line with its timestamp
    #[arg(long)]
    timestamps: bool,

    /// Show logs of the previous container instance
    #[arg(long, short = 'p')]
    previous: bool,

    /// Print the available logs and exit instead of following
    #[arg(long)]
    no_follow: bool,

    /// Buffer size for log lines
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Path to a TOML config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save the resulting display options as this context's defaults
    #[arg(long)]
    remember: bool,

    /// Write panel events as JSON lines
    #[arg(long)]
    json: bool,
}

impl Args {
    /// Layer the command line flags over stored preferences
    fn apply_to(&self, mut prefs: DisplayPreferences) -> DisplayPreferences {
        if let Some(lines) = self.tail_lines {
            prefs.line_limit = lines;
        }
        if self.timestamps {
            prefs.timestamps = true;
        }
        if self.previous {
            prefs.show_previous = true;
        }
        if self.no_follow {
            prefs.follow = false;
        }
        prefs
    }

    fn target(&self) -> StreamTarget {
        let target = StreamTarget::new(&self.context, &self.namespace, &self.pod);
        match &self.container {
            Some(container) => target.with_container(container),
            None => target,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing for debugging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run_app(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run_app(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let session_config = config
        .session_config(args.buffer_size)
        .context("Invalid session settings")?;

    // Load kubeconfig and validate the context
    let kube_client = KubeClient::new().await?;
    if !kube_client.has_context(&args.context) {
        anyhow::bail!("Context '{}' not found in kubeconfig", args.context);
    }

    let preferences = preferences_store(&args)?;
    let follow = preferences.load(&args.context).follow;
    let source = Arc::new(KubeLogSource::new(kube_client));
    let panels = Arc::new(TerminalPanelFactory::new(args.json, follow));
    let mut registry = PanelRegistry::new(panels, source, preferences, session_config)?;

    registry.open_or_reveal(&args.context, args.target())?;
    info!(context = %args.context, pod = %args.pod, "streaming logs");

    let outcome = wait_for_session(&registry, &args.context).await;
    registry.dispose(&args.context);
    outcome
}

/// Preferences for this run: stored defaults with CLI overrides on top
fn preferences_store(args: &Args) -> Result<Arc<dyn PreferencesStore>> {
    let Some(path) = TomlPreferencesStore::default_path() else {
        warn!("no home directory; display preferences will not be persisted");
        let prefs = args.apply_to(DisplayPreferences::default());
        return Ok(Arc::new(MemoryPreferencesStore::with_context(
            args.context.clone(),
            prefs,
        )));
    };

    let stored = TomlPreferencesStore::open(path);
    let prefs = args.apply_to(stored.load(&args.context));

    if args.remember {
        stored.save(&args.context, &prefs).with_context(|| {
            format!("Failed to save preferences to {}", stored.path().display())
        })?;
        return Ok(Arc::new(stored));
    }

    Ok(Arc::new(MemoryPreferencesStore::with_context(
        args.context.clone(),
        prefs,
    )))
}

/// Run until Ctrl-C or until the session stops on its own
async fn wait_for_session(registry: &PanelRegistry, context: &str) -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut poll = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            _ = &mut ctrl_c => return Ok(()),
            _ = poll.tick() => {
                match registry.session(context).map(|session| session.state()) {
                    Some(SessionState::Error) => {
                        anyhow::bail!("Log stream for context '{}' failed", context);
                    }
                    Some(state) if state.is_settled() => return Ok(()),
                    None => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}
