//! Periodically polled external JSON endpoints.
//!
//! A [`PollSource`] fetches one URL once while it is constructed, then refreshes the value in
//! a background task every interval. Readers always see the last complete value, never a
//! partially updated one.
//!
//! A failed refresh is terminal: the poller publishes the failure, stops, and the cache
//! discards the entry on its next access so that a new poller is constructed.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Instant, SystemTime};

use reqwest::Url;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheError, SourceId};
use crate::config::ExternalConfig;
use crate::utils::http::{self, HttpTimeouts};
use crate::utils::tasks::ActiveTasks;

/// The value currently held by a [`PollSource`].
#[derive(Clone, Debug)]
pub enum PollState {
    /// The latest successfully fetched value.
    Ready {
        value: Arc<Value>,
        fetched_at: SystemTime,
        /// Counts successful refreshes, the initial fetch is generation `0`.
        generation: u64,
    },
    /// The poller stopped after this error.
    Failed(CacheError),
}

/// Fetches and decodes one endpoint.
#[derive(Clone, Debug)]
struct Fetcher {
    client: reqwest::Client,
    url: Url,
}

impl Fetcher {
    async fn fetch(&self) -> Result<Value, CacheError> {
        let started = Instant::now();
        let result = self.fetch_inner().await;
        let status = match &result {
            Ok(_) => "ok",
            Err(err) => err.metrics_tag(),
        };
        metric!(counter("poll.fetch") += 1, "status" => status);
        metric!(timer("poll.fetch.duration") = started.elapsed());
        result
    }

    async fn fetch_inner(&self) -> Result<Value, CacheError> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| CacheError::FetchFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::FetchFailed(format!(
                "{} responded with {status}",
                self.url
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| CacheError::FetchFailed(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| CacheError::DecodeFailed(e.to_string()))
    }
}

/// A poller of one external endpoint, owned by a cache entry.
pub struct PollSource {
    id: SourceId,
    url: Url,
    interval: Duration,
    state: watch::Receiver<PollState>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for PollSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollSource")
            .field("id", &self.id)
            .field("url", &self.url.as_str())
            .field("interval", &self.interval)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl PollSource {
    /// Builds the client, fetches `url` once and starts refreshing it every `interval`.
    ///
    /// Nothing keeps running if this fails.
    #[tracing::instrument(skip_all, fields(url = url))]
    pub async fn start(
        url: &str,
        ca_bundle: &[u8],
        interval: Duration,
        config: &ExternalConfig,
        tasks: &ActiveTasks,
    ) -> Result<Arc<Self>, CacheError> {
        if interval.is_zero() {
            return Err(CacheError::ConstructionFailed(
                "refresh interval must be positive".into(),
            ));
        }
        first_tick(interval)?;
        let url: Url = url
            .parse()
            .map_err(|e| CacheError::ConstructionFailed(format!("invalid url `{url}`: {e}")))?;

        let client = http::create_client(&HttpTimeouts::from_config(config), ca_bundle)?;
        let fetcher = Fetcher {
            client,
            url: url.clone(),
        };

        let value = fetcher.fetch().await?;
        let (sender, state) = watch::channel(PollState::Ready {
            value: Arc::new(value),
            fetched_at: SystemTime::now(),
            generation: 0,
        });

        let id = SourceId::next();
        let stop = CancellationToken::new();
        let start = first_tick(interval)?;
        let task = tasks.spawn(poll(fetcher, start, interval, sender, stop.clone(), id));
        tracing::debug!(%id, "external poller started");

        Ok(Arc::new(Self {
            id,
            url,
            interval,
            state,
            stop,
            task: Mutex::new(Some(task)),
        }))
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns the latest value.
    ///
    /// Fails with [`CacheError::PollFailed`] once a refresh failed, and with
    /// [`CacheError::Cancelled`] once the poller was torn down.
    pub fn get(&self) -> Result<Arc<Value>, CacheError> {
        if self.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        match &*self.state.borrow() {
            PollState::Ready { value, .. } => Ok(Arc::clone(value)),
            PollState::Failed(err) => Err(CacheError::PollFailed(err.to_string())),
        }
    }

    /// A snapshot of the current state.
    pub fn state(&self) -> PollState {
        self.state.borrow().clone()
    }

    pub fn has_failed(&self) -> bool {
        matches!(*self.state.borrow(), PollState::Failed(_))
    }

    /// Subscribes to state changes, for observers that want to react to refreshes.
    pub fn subscribe(&self) -> watch::Receiver<PollState> {
        self.state.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Stops the poller. Only the first call has an effect.
    pub fn cancel(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return;
        };

        self.stop.cancel();
        task.abort();
        tracing::debug!(id = %self.id, url = %self.url, "external poller stopped");
    }
}

impl Drop for PollSource {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// The instant of the first refresh, if it can be represented at all.
fn first_tick(interval: Duration) -> Result<tokio::time::Instant, CacheError> {
    tokio::time::Instant::now()
        .checked_add(interval)
        .ok_or_else(|| {
            CacheError::ConstructionFailed(format!(
                "refresh interval of {}s is too large",
                interval.as_secs()
            ))
        })
}

/// Refreshes the value every `interval`, starting at `start`, until stopped or a refresh fails.
async fn poll(
    fetcher: Fetcher,
    start: tokio::time::Instant,
    interval: Duration,
    sender: watch::Sender<PollState>,
    stop: CancellationToken,
    id: SourceId,
) {
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut generation = 0;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            result = fetcher.fetch() => result,
        };

        match result {
            Ok(value) => {
                generation += 1;
                sender.send_replace(PollState::Ready {
                    value: Arc::new(value),
                    fetched_at: SystemTime::now(),
                    generation,
                });
                tracing::trace!(%id, generation, "external value refreshed");
            }
            Err(err) => {
                tracing::warn!(%id, url = %fetcher.url, error = %err, "external poller failed");
                sender.send_replace(PollState::Failed(err));
                return;
            }
        }
    }
}
