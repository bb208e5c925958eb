use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use narrate_core::{Effect, Msg, QueryKey};
use narrate_engine::Backend;
use narrate_logging::{narrate_debug, narrate_warn};
use tokio::sync::mpsc;

/// Keys being fetched, each with a flag set when another refetch was asked
/// for while the request ran.
type InFlight = Arc<Mutex<BTreeMap<QueryKey, bool>>>;

/// Runs core effects against the backend and reports results as messages.
pub struct EffectRunner {
    backend: Arc<dyn Backend>,
    msg_tx: mpsc::UnboundedSender<Msg>,
    in_flight: InFlight,
}

impl EffectRunner {
    pub fn new(backend: Arc<dyn Backend>, msg_tx: mpsc::UnboundedSender<Msg>) -> Self {
        Self {
            backend,
            msg_tx,
            in_flight: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn enqueue(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Refetch(key) => self.refetch(key),
            }
        }
    }

    /// One request per key at a time. A refetch asked for while the request
    /// runs makes it fetch once more and report only the later result.
    fn refetch(&self, key: QueryKey) {
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(again) = in_flight.get_mut(&key) {
                narrate_debug!("Refetch of {:?} already in flight; repeating it", key);
                *again = true;
                return;
            }
            in_flight.insert(key.clone(), false);
        }

        let backend = self.backend.clone();
        let msg_tx = self.msg_tx.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            let result = loop {
                let result = backend.fetch(&key).await;
                let mut in_flight = in_flight.lock().unwrap_or_else(PoisonError::into_inner);
                match in_flight.get_mut(&key) {
                    Some(again) if *again => {
                        *again = false;
                        narrate_debug!("Fetching {:?} again", key);
                    }
                    _ => {
                        in_flight.remove(&key);
                        break result;
                    }
                }
            };
            let msg = match result {
                Ok(data) => Msg::QueryLoaded { key, data },
                Err(err) => {
                    narrate_warn!("Refetch of {:?} failed: {}", key, err);
                    Msg::QueryFailed {
                        key,
                        message: err.to_string(),
                    }
                }
            };
            let _ = msg_tx.send(msg);
        });
    }
}
