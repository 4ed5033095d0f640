//! Replay loop for the durable queue store.
//!
//! Walks the stored keys in insertion order and delivers each entry,
//! deleting it on success. A remote that is down pauses the walk instead of
//! burning attempts on every key; any other per-entry failure is reported
//! once and the entry stays for the next pass. The loop ends when the target
//! is cancelled.

use std::{sync::Arc, time::Duration};

use logship_core::{EntryStore, StoreError};
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{error::TargetError, target::Shared};

/// Pause between passes over the store.
const REPLAY_INTERVAL: Duration = Duration::from_millis(250);

/// Pause after the remote was found unreachable.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) async fn run<E>(
    shared: Arc<Shared<E>>,
    store: Arc<dyn EntryStore<E>>,
    cancel: CancellationToken,
) where
    E: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let keys = match store.list() {
            Ok(keys) => keys,
            Err(err) => {
                shared.log_once.log_once(&shared.target_name(), &err);
                Vec::new()
            }
        };

        let mut pause = REPLAY_INTERVAL;
        for key in keys {
            if cancel.is_cancelled() {
                return;
            }
            match shared.send_from_store(store.as_ref(), &key).await {
                Ok(()) => {}
                Err(TargetError::Store(StoreError::NotConnected)) => {
                    // Remote down: no point walking the rest of the keys.
                    debug!(target_name = %shared.target_name(), "remote offline, pausing replay");
                    pause = RECONNECT_INTERVAL;
                    break;
                }
                Err(err) => {
                    // Entry stays in the store and is retried next pass.
                    shared.log_once.log_once(shared.client.endpoint().as_str(), &err);
                }
            }
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            () = shared.clock.sleep(pause) => {}
        }
    }
}
