// orchestrator-service-rs/src/listener.rs
// Long-lived task feeding remote commands into the dispatch loop

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map};
use shared_types::RequestRecord;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::correlator::ResultSink;
use crate::dispatch::{DispatchError, Dispatcher};
use crate::remote::{CommandSource, RemoteCommand};
use crate::status::labels;

const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Counters returned when the listener stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ListenerSummary {
    pub received: usize,
    pub completed: usize,
    pub rejected: usize,
    pub skipped: usize,
}

pub struct RemoteListener {
    dispatcher: Arc<Dispatcher>,
    source: Arc<dyn CommandSource>,
    sink: Arc<dyn ResultSink>,
    permits: Arc<Semaphore>,
    error_backoff: Duration,
}

impl RemoteListener {
    /// At most `max_concurrent` remote requests run at once.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        source: Arc<dyn CommandSource>,
        sink: Arc<dyn ResultSink>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            dispatcher,
            source,
            sink,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }

    /// Pause after a failed poll before asking the source again.
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<ListenerSummary> {
        tokio::spawn(self.run(shutdown))
    }

    /// Take commands until `shutdown` turns true or the source is exhausted,
    /// then wait for every request already started.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> ListenerSummary {
        let device_id = self.dispatcher.session().device_id().to_string();
        let mut summary = ListenerSummary::default();
        let mut tasks: JoinSet<Result<RequestRecord, DispatchError>> = JoinSet::new();

        info!(device_id = %device_id, "remote listener started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                next = self.source.next() => next,
            };

            while let Some(joined) = tasks.try_join_next() {
                tally(&mut summary, joined);
            }

            let command = match next {
                Ok(Some(command)) => command,
                Ok(None) => {
                    info!("remote command source exhausted");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "remote poll failed, backing off");
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.error_backoff) => {}
                    }
                    continue;
                }
            };

            summary.received += 1;
            if command.device_id != device_id {
                debug!(command_id = %command.id, target = %command.device_id, "command for another device");
                summary.skipped += 1;
                continue;
            }

            if let Err(err) = self.source.claim(&command).await {
                warn!(command_id = %command.id, error = %err, "could not claim remote command");
                summary.skipped += 1;
                continue;
            }

            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            info!(command_id = %command.id, request = %command.command, "remote command received");
            let dispatcher = self.dispatcher.clone();
            let source = self.source.clone();
            let sink = self.sink.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = dispatcher
                    .dispatch_remote(&command.command, &command.id, sink.as_ref())
                    .await;
                if let Err(err) = &result {
                    if err.is_refused() {
                        close_refused(&dispatcher, source.as_ref(), &command, err).await;
                    }
                }
                result
            });
        }

        while let Some(joined) = tasks.join_next().await {
            tally(&mut summary, joined);
        }

        info!(
            received = summary.received,
            completed = summary.completed,
            rejected = summary.rejected,
            "remote listener stopped"
        );
        summary
    }
}

/// A claimed command that never got a record still needs a terminal write
/// and a status update.
async fn close_refused(
    dispatcher: &Dispatcher,
    source: &dyn CommandSource,
    command: &RemoteCommand,
    err: &DispatchError,
) {
    let reason = err.to_string();
    if let Err(reject_err) = source.reject(command, &reason).await {
        error!(command_id = %command.id, error = %reject_err, "could not close refused remote command");
    }

    let mut extra = Map::new();
    extra.insert("command_id".into(), json!(command.id));
    extra.insert("error_message".into(), json!(reason));
    dispatcher.publish(labels::ERROR, extra).await;
}

fn tally(
    summary: &mut ListenerSummary,
    joined: Result<Result<RequestRecord, DispatchError>, JoinError>,
) {
    match joined {
        Ok(Ok(record)) => {
            debug!(request_id = %record.request_id, outcome = %record.outcome, "remote request finished");
            summary.completed += 1;
        }
        Ok(Err(err)) => {
            warn!(error = %err, "remote request rejected");
            summary.rejected += 1;
        }
        Err(err) => {
            error!(error = %err, "remote dispatch task failed");
            summary.rejected += 1;
        }
    }
}
