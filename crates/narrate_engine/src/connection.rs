use std::future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use narrate_logging::{narrate_debug, narrate_info, narrate_trace, narrate_warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::backoff::{BackoffPolicy, ReconnectDecision, ReconnectState};
use crate::sse::EventStream;
use crate::{
    ChannelMessage, ChannelType, ConnectionSnapshot, ConnectionStatus, EventTransport, FanOut,
    TransportError,
};

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub base_url: String,
    pub channels: Vec<String>,
    pub backoff: BackoffPolicy,
    /// Longest wait for `EventTransport::open`; an attempt that takes longer
    /// counts as a failure.
    pub open_timeout: Duration,
    /// Period of the uptime refresh while connected; `None` disables it.
    pub uptime_refresh: Option<Duration>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8765".to_string(),
            channels: vec!["jobs".to_string(), "health".to_string()],
            backoff: BackoffPolicy::default(),
            open_timeout: Duration::from_secs(15),
            uptime_refresh: Some(Duration::from_secs(1)),
        }
    }
}

impl ConnectionSettings {
    /// `{base}/api/events/subscribe?channels=a,b`. Reconnects reuse it as is.
    pub fn subscribe_url(&self) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&format!(
            "{}/api/events/subscribe",
            self.base_url.trim_end_matches('/')
        ))?;
        url.query_pairs_mut()
            .append_pair("channels", &self.channels.join(","));
        Ok(url)
    }
}

struct Shared {
    snapshot: watch::Sender<ConnectionSnapshot>,
    reconnect: Mutex<ReconnectState>,
}

impl Shared {
    fn reconnect(&self) -> MutexGuard<'_, ReconnectState> {
        self.reconnect.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, modify: impl FnOnce(&mut ConnectionSnapshot)) {
        self.snapshot.send_modify(modify);
    }

    fn fall_back_to_polling(&self) {
        let attempts = self.reconnect().attempts();
        self.update(|snapshot| {
            snapshot.status = ConnectionStatus::Disconnected;
            snapshot.channel_type = ChannelType::Polling;
            snapshot.reconnect_attempts = attempts;
            snapshot.uptime = None;
        });
    }
}

struct Driver {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owner of the single push channel.
///
/// Shared by reference (`Arc<ConnectionManager>`). The background driver only
/// holds clones of the transport, fan-out and shared state, so dropping the
/// manager stops it.
pub struct ConnectionManager {
    settings: ConnectionSettings,
    transport: Arc<dyn EventTransport>,
    fanout: FanOut,
    shared: Arc<Shared>,
    driver: Mutex<Option<Driver>>,
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        transport: Arc<dyn EventTransport>,
        fanout: FanOut,
    ) -> Self {
        let (snapshot, _) = watch::channel(ConnectionSnapshot::default());
        Self {
            settings,
            transport,
            fanout,
            shared: Arc::new(Shared {
                snapshot,
                reconnect: Mutex::new(ReconnectState::default()),
            }),
            driver: Mutex::new(None),
        }
    }

    pub fn fanout(&self) -> &FanOut {
        &self.fanout
    }

    pub fn status(&self) -> ConnectionSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.shared.snapshot.subscribe()
    }

    fn driver(&self) -> MutexGuard<'_, Option<Driver>> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the push channel unless one is open or being attempted.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut driver = self.driver();
        if driver
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
        {
            narrate_debug!("Push channel already active; connect ignored");
            return;
        }
        if !self.transport.is_supported() {
            narrate_info!("Push transport unsupported; using polling");
            self.shared.fall_back_to_polling();
            return;
        }
        if self.shared.reconnect().exhausted(&self.settings.backoff) {
            narrate_info!("Reconnect attempts exhausted; staying on polling");
            self.shared.fall_back_to_polling();
            return;
        }
        let url = match self.settings.subscribe_url() {
            Ok(url) => url,
            Err(err) => {
                narrate_warn!("Invalid push url from {}: {}", self.settings.base_url, err);
                self.shared.fall_back_to_polling();
                return;
            }
        };

        let cancel = CancellationToken::new();
        let task = DriverTask {
            url,
            backoff: self.settings.backoff,
            open_timeout: self.settings.open_timeout,
            uptime_refresh: self.settings.uptime_refresh,
            transport: Arc::clone(&self.transport),
            fanout: self.fanout.clone(),
            shared: Arc::clone(&self.shared),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run());
        *driver = Some(Driver { cancel, handle });
    }

    /// Clears the reconnect budget and connects again. Used to leave the
    /// polling fallback on user request.
    pub fn retry_push(&self) {
        narrate_info!("Retrying push channel");
        *self.shared.reconnect() = ReconnectState::default();
        self.shared.update(|snapshot| snapshot.reconnect_attempts = 0);
        self.connect();
    }

    /// Closes the channel, cancels any pending reconnect, and waits for the
    /// driver to stop.
    pub async fn disable(&self) {
        let driver = self.driver().take();
        if let Some(driver) = driver {
            driver.cancel.cancel();
            if let Err(err) = driver.handle.await {
                narrate_warn!("Push driver ended abnormally: {}", err);
            }
        }
        self.shared.update(|snapshot| {
            snapshot.status = ConnectionStatus::Disconnected;
            snapshot.channel_type = ChannelType::None;
            snapshot.uptime = None;
        });
        narrate_info!("Push channel disabled");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(driver) = self.driver().take() {
            driver.cancel.cancel();
        }
    }
}

struct DriverTask {
    url: Url,
    backoff: BackoffPolicy,
    open_timeout: Duration,
    uptime_refresh: Option<Duration>,
    transport: Arc<dyn EventTransport>,
    fanout: FanOut,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl DriverTask {
    async fn run(self) {
        loop {
            if self.shared.reconnect().exhausted(&self.backoff) {
                self.shared.fall_back_to_polling();
                return;
            }
            self.shared.update(|snapshot| {
                snapshot.status = ConnectionStatus::Connecting;
                snapshot.uptime = None;
            });
            narrate_debug!("Opening push channel {}", self.url);

            let attempt = tokio::time::timeout(self.open_timeout, self.transport.open(&self.url));
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return,
                opened = attempt => opened.unwrap_or_else(|_| {
                    Err(TransportError::Connect(format!(
                        "open did not finish within {:?}",
                        self.open_timeout
                    )))
                }),
            };
            let failure = match opened {
                Ok(stream) => match self.pump(stream).await {
                    Some(err) => err,
                    None => return,
                },
                Err(err) => err,
            };

            let decision = self.shared.reconnect().record_failure(&self.backoff);
            let attempts = self.shared.reconnect().attempts();
            self.shared.update(|snapshot| {
                snapshot.status = ConnectionStatus::Error;
                snapshot.reconnect_attempts = attempts;
                snapshot.uptime = None;
            });
            match decision {
                ReconnectDecision::GiveUp => {
                    narrate_warn!(
                        "Push channel failed ({}); giving up after {} attempts, polling instead",
                        failure,
                        attempts
                    );
                    self.shared.fall_back_to_polling();
                    return;
                }
                ReconnectDecision::Retry(delay) => {
                    narrate_warn!(
                        "Push channel failed ({}); reconnecting in {:?} (attempt {})",
                        failure,
                        delay,
                        attempts
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Forwards messages until the stream fails. `None` means cancelled.
    async fn pump(&self, mut stream: EventStream) -> Option<TransportError> {
        let opened_at = Instant::now();
        self.shared.reconnect().record_open();
        self.shared.update(|snapshot| {
            snapshot.status = ConnectionStatus::Connected;
            snapshot.channel_type = ChannelType::Push;
            snapshot.reconnect_attempts = 0;
            snapshot.uptime = Some(Duration::ZERO);
        });

        let mut ticker = self.uptime_refresh.map(|period| {
            let mut ticker = tokio::time::interval_at(opened_at + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                item = stream.next() => match item {
                    Some(Ok(message)) => self.deliver(&message, opened_at),
                    Some(Err(err)) => return Some(err),
                    None => return Some(TransportError::Closed),
                },
                _ = tick(&mut ticker) => {
                    let uptime = opened_at.elapsed();
                    self.shared.update(|snapshot| snapshot.uptime = Some(uptime));
                }
            }
        }
    }

    fn deliver(&self, message: &ChannelMessage, opened_at: Instant) {
        let uptime = opened_at.elapsed();
        self.shared.update(|snapshot| {
            snapshot.last_event_time = Some(Utc::now());
            snapshot.events_received += 1;
            snapshot.uptime = Some(uptime);
        });
        narrate_trace!("Push message {:?}", message.event);
        self.fanout.publish(message);
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => future::pending().await,
    }
}
