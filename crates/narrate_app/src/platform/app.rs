use std::future;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use narrate_core::{
    parse_event, update, Effect, InvalidationScope, JobFilter, Msg, PollPolicy, QueryKey,
    Reconciler,
};
use narrate_engine::{
    Backend, ChannelMessage, ChannelType, ConnectionManager, ConnectionSnapshot, ConnectionStatus,
    FanOut, ReqwestBackend, ReqwestTransport,
};
use narrate_logging::{narrate_debug, narrate_info, narrate_trace, narrate_warn};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use super::config::{config_path, AppConfig};
use super::effects::EffectRunner;
use super::{logging, report};

pub async fn run_app() -> anyhow::Result<()> {
    let path = config_path(std::env::args());
    let (config, config_error) = match AppConfig::load(&path) {
        Ok(config) => (config, None),
        Err(err) => (AppConfig::default(), Some(err)),
    };
    logging::initialize(config.log_destination, config.level_filter());
    if let Some(err) = config_error {
        narrate_warn!("Using default configuration: {}", err);
    }
    narrate_info!("Syncing with {} (config {:?})", config.backend_url, path);

    let transport = Arc::new(ReqwestTransport::new(config.transport_settings())?);
    let backend: Arc<dyn Backend> = Arc::new(ReqwestBackend::new(config.backend_settings())?);

    let fanout = FanOut::new();
    let (channel_tx, mut channel_rx) = mpsc::unbounded_channel::<ChannelMessage>();
    let subscription = fanout.subscribe(move |message| {
        channel_tx
            .send(message.clone())
            .map_err(|_| anyhow!("sync loop has stopped"))
    });

    let manager = ConnectionManager::new(config.connection_settings(), transport, fanout);
    let mut status_rx = manager.watch();

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<Msg>();
    let mut sync = SyncLoop::new(EffectRunner::new(backend, msg_tx), config.poll_policy());
    sync.runner.enqueue(seed_queries(&config.watch_chapters));
    manager.connect();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut next_poll: Option<Instant> = None;

    loop {
        let deadline = next_poll;
        let poll_due = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => future::pending().await,
            }
        };

        tokio::select! {
            result = &mut shutdown => {
                if let Err(err) = result {
                    narrate_warn!("Could not listen for Ctrl-C: {}", err);
                }
                break;
            }
            Some(message) = channel_rx.recv() => sync.on_channel_message(message),
            Some(msg) = msg_rx.recv() => sync.dispatch(msg),
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status_rx.borrow_and_update().clone();
                sync.on_status(&snapshot);
            }
            () = poll_due => {
                next_poll = None;
                narrate_debug!("Polling for changes");
                sync.dispatch(Msg::RefreshRequested(InvalidationScope::All));
            }
        }

        let polling = status_rx.borrow().is_polling();
        next_poll = match sync.poll.next_poll(polling, sync.state.has_unresolved_work()) {
            Some(interval) => next_poll.or_else(|| Some(Instant::now() + interval)),
            None => None,
        };
    }

    narrate_info!("Shutting down");
    subscription.unsubscribe();
    manager.disable().await;
    Ok(())
}

/// The active job list plus every watched chapter.
fn seed_queries(watch_chapters: &[String]) -> Vec<Effect> {
    std::iter::once(QueryKey::Jobs(JobFilter::active()))
        .chain(watch_chapters.iter().cloned().map(QueryKey::Parent))
        .map(Effect::Refetch)
        .collect()
}

struct SyncLoop {
    state: Reconciler,
    runner: EffectRunner,
    poll: PollPolicy,
    last_connection: ConnectionSnapshot,
    was_connected: bool,
}

impl SyncLoop {
    fn new(runner: EffectRunner, poll: PollPolicy) -> Self {
        Self {
            state: Reconciler::new(),
            runner,
            poll,
            last_connection: ConnectionSnapshot::default(),
            was_connected: false,
        }
    }

    fn on_channel_message(&mut self, message: ChannelMessage) {
        match parse_event(message.event.as_deref(), &message.data) {
            Ok(Some(event)) => self.dispatch(Msg::Event {
                event,
                received_at: Utc::now(),
            }),
            Ok(None) => narrate_trace!("Ignoring non-job message"),
            Err(err) => narrate_warn!("Dropping malformed event: {}", err),
        }
    }

    fn dispatch(&mut self, msg: Msg) {
        let state = std::mem::take(&mut self.state);
        let (state, effects) = update(state, msg);
        self.state = state;
        self.runner.enqueue(effects);

        if self.state.consume_dirty() {
            for line in report::render_view(&self.state.view()) {
                narrate_info!("{}", line);
            }
        }
    }

    /// Events sent while the push channel was down are lost, so a fresh
    /// connection refreshes everything cached.
    fn on_status(&mut self, snapshot: &ConnectionSnapshot) {
        let previous = std::mem::replace(&mut self.last_connection, snapshot.clone());
        if previous.status == snapshot.status && previous.channel_type == snapshot.channel_type {
            return;
        }
        narrate_info!("{}", report::render_connection(snapshot));

        let connected = snapshot.status == ConnectionStatus::Connected
            && snapshot.channel_type == ChannelType::Push;
        if connected && std::mem::replace(&mut self.was_connected, true) {
            self.dispatch(Msg::RefreshRequested(InvalidationScope::All));
        }
    }
}
