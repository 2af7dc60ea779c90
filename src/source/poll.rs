//! Polling backend: stat every followed file once per sleep interval.

use super::files::FileTable;
use crate::filter::Filter;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SLEEP_TIME: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct PollSource {
    pub(crate) files: FileTable,
    sleep_time: Duration,
    primed: bool,
}

impl PollSource {
    pub fn new(sleep_time: Duration) -> Self {
        Self {
            files: FileTable::default(),
            sleep_time,
            primed: false,
        }
    }

    pub fn sleep_time(&self) -> Duration {
        self.sleep_time
    }

    pub fn set_sleep_time(&mut self, sleep_time: Duration) {
        self.sleep_time = sleep_time;
    }

    /// Sleep until the next scan. The first call returns at once.
    pub async fn wait(&mut self) {
        if self.primed {
            tokio::time::sleep(self.sleep_time).await;
        }
        self.primed = true;
    }

    /// One scan: reopen pending paths, then read every modified file.
    pub async fn process(&mut self, filter: &mut Filter, stop: &CancellationToken) -> usize {
        self.files.retry_pending(filter);
        self.files.read(filter, stop).await
    }
}
