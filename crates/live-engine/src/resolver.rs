//! Stream metadata resolver.
//!
//! `subscribe(channel)` yields an initial snapshot right away and then one
//! snapshot per playback-relevant upstream change.  Changes to fields such as
//! the viewer counter update the stored snapshot silently, without waking
//! subscribers, so they never cause a remount downstream.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use live_proto::config::{expand_channel, MetadataConfig};
use live_proto::protocol::StreamMetadata;
use tokio::sync::{watch, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::SourceError;

#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch(&self, channel_id: &str) -> Result<StreamMetadata, SourceError>;

    /// Resolves when upstream may have changed.  Polling sources just sleep.
    async fn changed(&self, channel_id: &str) -> Result<(), SourceError>;
}

pub struct MetadataResolver {
    source: Arc<dyn MetadataSource>,
    cache: Arc<Mutex<HashMap<String, StreamMetadata>>>,
}

/// Pause after a failed change-wait before asking upstream again.
const RETRY_DELAY: Duration = Duration::from_secs(2);

impl MetadataResolver {
    pub fn new(source: Arc<dyn MetadataSource>) -> Self {
        Self {
            source,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Never fails: an unreachable upstream yields an inactive snapshot.
    pub async fn subscribe(&self, channel_id: &str) -> MetadataSubscription {
        let channel = channel_id.to_string();
        let initial = match self.source.fetch(&channel).await {
            Ok(meta) => {
                let meta = for_channel(meta, &channel);
                self.cache.lock().await.insert(channel.clone(), meta.clone());
                meta
            }
            Err(e) => {
                warn!("metadata: initial fetch for '{}' failed: {}", channel, e);
                let cached = self.cache.lock().await.get(&channel).cloned();
                match cached {
                    Some(mut meta) => {
                        meta.is_active = false;
                        meta
                    }
                    None => StreamMetadata::offline(channel.clone()),
                }
            }
        };
        info!(
            "metadata: subscribed to '{}' (active={})",
            channel, initial.is_active
        );

        let (tx, rx) = watch::channel(initial);
        let source = Arc::clone(&self.source);
        let cache = Arc::clone(&self.cache);
        let task = tokio::spawn(async move {
            loop {
                if let Err(e) = source.changed(&channel).await {
                    warn!("metadata: change feed for '{}' failed: {}", channel, e);
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
                let meta = match source.fetch(&channel).await {
                    Ok(meta) => for_channel(meta, &channel),
                    Err(e) => {
                        warn!("metadata: refresh of '{}' failed, keeping last: {}", channel, e);
                        continue;
                    }
                };
                cache.lock().await.insert(channel.clone(), meta.clone());
                let notified = tx.send_if_modified(|current| {
                    let relevant = !current.same_playback(&meta);
                    *current = meta;
                    relevant
                });
                if notified {
                    debug!("metadata: '{}' changed", channel);
                }
                if tx.is_closed() {
                    break;
                }
            }
        });

        MetadataSubscription {
            rx,
            delivered_initial: false,
            task: task.abort_handle(),
        }
    }
}

fn for_channel(mut meta: StreamMetadata, channel_id: &str) -> StreamMetadata {
    if meta.channel_id.is_empty() {
        meta.channel_id = channel_id.to_string();
    }
    meta
}

/// Live subscription to one channel.  Dropping it stops the upstream feed.
pub struct MetadataSubscription {
    rx: watch::Receiver<StreamMetadata>,
    delivered_initial: bool,
    task: AbortHandle,
}

impl MetadataSubscription {
    /// Latest snapshot, including silently updated fields.
    pub fn latest(&self) -> StreamMetadata {
        self.rx.borrow().clone()
    }

    pub async fn next(&mut self) -> Option<StreamMetadata> {
        if !self.delivered_initial {
            self.delivered_initial = true;
            return Some(self.rx.borrow_and_update().clone());
        }
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamMetadata> + Send {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|meta| (meta, sub))
        })
    }
}

impl Drop for MetadataSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ── HTTP polling source ───────────────────────────────────────────────────────

/// Polls a JSON endpoint returning the metadata input contract.
pub struct HttpMetadataSource {
    client: reqwest::Client,
    url_template: String,
    poll_interval: Duration,
}

impl HttpMetadataSource {
    pub fn new(config: &MetadataConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url_template: config.url_template.clone(),
            poll_interval: config.poll_interval(),
        }
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn fetch(&self, channel_id: &str) -> Result<StreamMetadata, SourceError> {
        let url = expand_channel(&self.url_template, channel_id);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(SourceError::Status(response.status().as_u16()));
        }
        Ok(response.json::<StreamMetadata>().await?)
    }

    async fn changed(&self, _channel_id: &str) -> Result<(), SourceError> {
        tokio::time::sleep(self.poll_interval).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::collections::VecDeque;

    /// Replays a script of fetch results; `changed` fires every 100ms.
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<StreamMetadata, SourceError>>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<StreamMetadata, SourceError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    #[async_trait]
    impl MetadataSource for ScriptedSource {
        async fn fetch(&self, _channel_id: &str) -> Result<StreamMetadata, SourceError> {
            self.script
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Err(SourceError::Unavailable("script exhausted".into())))
        }

        async fn changed(&self, _channel_id: &str) -> Result<(), SourceError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }
    }

    fn active(viewers: u64, segmented: Option<&str>) -> StreamMetadata {
        StreamMetadata {
            channel_id: "main".into(),
            is_active: true,
            viewer_count: Some(viewers),
            hints: live_proto::protocol::TransportHints {
                low_latency_base_url: None,
                segmented_url: segmented.map(str::to_string),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_initial_failure_yields_inactive_snapshot() {
        let source = ScriptedSource::new(vec![Err(SourceError::Status(503))]);
        let resolver = MetadataResolver::new(source);
        let mut sub = resolver.subscribe("main").await;
        let first = sub.next().await.unwrap();
        assert_eq!(first.channel_id, "main");
        assert!(!first.is_active);
    }

    #[tokio::test]
    async fn test_initial_failure_reuses_cache_as_inactive() {
        let source = ScriptedSource::new(vec![
            Ok(active(5, Some("https://cdn/a.m3u8"))),
            Err(SourceError::Status(500)),
        ]);
        let resolver = MetadataResolver::new(source);
        drop(resolver.subscribe("main").await);

        let mut sub = resolver.subscribe("main").await;
        let snap = sub.next().await.unwrap();
        assert!(!snap.is_active);
        assert_eq!(snap.hints.segmented_url.as_deref(), Some("https://cdn/a.m3u8"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewer_count_changes_are_collapsed() {
        let source = ScriptedSource::new(vec![
            Ok(active(1, Some("https://cdn/a.m3u8"))),
            Ok(active(2, Some("https://cdn/a.m3u8"))),
            Ok(active(3, Some("https://cdn/a.m3u8"))),
            Ok(active(4, Some("https://cdn/b.m3u8"))),
        ]);
        let resolver = MetadataResolver::new(source);
        let mut stream = Box::pin(resolver.subscribe("main").await.into_stream());

        let first = stream.next().await.unwrap();
        assert_eq!(first.viewer_count, Some(1));

        // Next delivery skips the two viewer-only updates.
        let second = stream.next().await.unwrap();
        assert_eq!(second.hints.segmented_url.as_deref(), Some("https://cdn/b.m3u8"));
        assert_eq!(second.viewer_count, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_keeps_last_snapshot() {
        let source = ScriptedSource::new(vec![
            Ok(active(1, Some("https://cdn/a.m3u8"))),
            Err(SourceError::Status(502)),
        ]);
        let resolver = MetadataResolver::new(source);
        let sub = resolver.subscribe("main").await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(sub.latest().is_active);
    }
}
