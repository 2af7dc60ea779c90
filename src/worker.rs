//! One task per jail running its filter over its log source.

use crate::filter::Filter;
use crate::source::LogSource;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Default bound on how long `stop` waits for the task to finish.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct FilterWorker {
    jail: String,
    stop: CancellationToken,
    handle: JoinHandle<(Filter, LogSource)>,
}

impl FilterWorker {
    /// Spawn the read → match loop. The filter and source come back from
    /// [`FilterWorker::stop`] when the task ends in time.
    pub fn spawn(mut filter: Filter, mut source: LogSource) -> Self {
        let jail = filter.jail().to_string();
        let stop = CancellationToken::new();
        let token = stop.clone();
        let handle = tokio::spawn(async move {
            filter.set_active(true);
            info!(jail = %filter.jail(), backend = %source.kind(), "Jail started");
            source.run(&mut filter, token).await;
            filter.set_active(false);
            info!(jail = %filter.jail(), "Jail stopped");
            (filter, source)
        });
        Self { jail, stop, handle }
    }

    pub fn jail(&self) -> &str {
        &self.jail
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Token that stops this worker when cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Signal the worker and wait at most `timeout` for it to finish.
    /// A worker that overruns is aborted.
    pub async fn stop(self, timeout: Duration) -> Option<(Filter, LogSource)> {
        self.stop.cancel();
        let abort = self.handle.abort_handle();
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(parts)) => Some(parts),
            Ok(Err(e)) => {
                error!(jail = %self.jail, error = %e, "Jail worker failed");
                None
            }
            Err(_) => {
                error!(jail = %self.jail, ?timeout, "Jail worker did not stop in time, aborting");
                abort.abort();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::dns::{DnsUtils, StaticResolver};
    use crate::clock::Clock;
    use crate::failmanager::FailManager;
    use crate::source::{BackendKind, SeekPolicy};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_worker_processes_and_stops() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        let mut log = String::new();
        for sec in 0..3 {
            log.push_str(&format!("2005-08-14 10:00:0{sec} auth failure from 192.0.2.9\n"));
        }
        std::fs::write(&path, log).unwrap();

        let clock = Clock::fixed(1_124_013_610.0);
        let dns = Arc::new(DnsUtils::new(Arc::new(StaticResolver::new()), clock.clone()));
        let fm = Arc::new(FailManager::new(clock));
        let mut filter = Filter::new("sshd", fm.clone(), dns);
        filter.set_ignore_self(false);
        filter.set_log_time_zone(Some("UTC")).unwrap();
        filter.add_fail_regex("auth failure from <HOST>").unwrap();

        let mut source = LogSource::new(BackendKind::Polling, Duration::from_millis(20)).unwrap();
        source.add_path(&path, SeekPolicy::Head, &mut filter).unwrap();

        let worker = FilterWorker::spawn(filter, source);
        tokio::time::timeout(Duration::from_secs(5), fm.ticket_ready()).await.unwrap();

        let (filter, _) = worker.stop(Duration::from_secs(5)).await.unwrap();
        assert!(filter.in_operation());
        assert!(!filter.is_active());
        let ticket = fm.to_ban().unwrap();
        assert_eq!(ticket.identity().to_string(), "192.0.2.9");
    }
}
