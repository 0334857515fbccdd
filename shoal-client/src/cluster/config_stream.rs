//! HTTP streaming configuration subscriber.
//!
//! Each open bucket holds a long-lived GET against
//! `/pools/default/bs/<bucket>` on one of the cluster's management
//! endpoints. The server emits one JSON config per line; every line is
//! parsed and forwarded to the context's serialized handler. On failure
//! the subscriber walks the endpoint list and backs off exponentially,
//! capped at ten seconds.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::context::ConfigPublish;
use super::kv_map::ClusterMap;
use crate::config::ClientConfig;

/// Backoff ceiling between reconnect rounds.
const MAX_BACKOFF: Duration = Duration::from_secs(10);
/// Backoff growth factor.
const BACKOFF_MULTIPLIER: u32 = 10;

/// Handle to one bucket's streaming subscriber task.
pub struct ConfigStream {
    task: JoinHandle<()>,
    stop: CancellationToken,
}

impl ConfigStream {
    /// Spawns a subscriber streaming configs for `bucket`.
    pub fn spawn(
        bucket: String,
        hosts: Vec<String>,
        http_port: u16,
        config: Arc<ClientConfig>,
        publisher: mpsc::Sender<ConfigPublish>,
        stop: CancellationToken,
    ) -> Self {
        let task = tokio::spawn(stream_loop(
            bucket,
            hosts,
            http_port,
            config,
            publisher,
            stop.clone(),
        ));
        Self { task, stop }
    }

    /// Stops the subscriber and waits for the task to finish.
    pub async fn stop(self) {
        self.stop.cancel();
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn stream_loop(
    bucket: String,
    hosts: Vec<String>,
    http_port: u16,
    config: Arc<ClientConfig>,
    publisher: mpsc::Sender<ConfigPublish>,
    stop: CancellationToken,
) {
    let client = match reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(error = %e, "could not build HTTP client for config stream");
            return;
        }
    };

    let mut backoff = Duration::ZERO;

    loop {
        if stop.is_cancelled() {
            return;
        }

        let mut connected_any = false;
        for host in &hosts {
            if stop.is_cancelled() {
                return;
            }

            match stream_from_host(&client, &bucket, host, http_port, &config, &publisher, &stop)
                .await
            {
                Ok(()) => {
                    // Stream ended cleanly (server rotated); restart the
                    // walk without backing off.
                    connected_any = true;
                }
                Err(e) => {
                    tracing::debug!(
                        bucket = %bucket,
                        host = %host,
                        error = %e,
                        "config stream endpoint failed"
                    );
                }
            }
        }

        if connected_any {
            backoff = Duration::ZERO;
            continue;
        }

        backoff = if backoff.is_zero() {
            Duration::from_millis(100)
        } else {
            (backoff * BACKOFF_MULTIPLIER).min(MAX_BACKOFF)
        };
        tracing::warn!(
            bucket = %bucket,
            backoff = ?backoff,
            "all config stream endpoints failed, backing off"
        );

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = stop.cancelled() => return,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn stream_from_host(
    client: &reqwest::Client,
    bucket: &str,
    host: &str,
    http_port: u16,
    config: &Arc<ClientConfig>,
    publisher: &mpsc::Sender<ConfigPublish>,
    stop: &CancellationToken,
) -> Result<(), reqwest::Error> {
    let url = format!("http://{host}:{http_port}/pools/default/bs/{bucket}");

    let mut request = client.get(&url);
    if !config.username().is_empty() {
        request = request.basic_auth(config.username(), Some(config.password()));
    }

    let response = request.send().await?.error_for_status()?;
    tracing::info!(bucket = %bucket, host = %host, "config stream connected");

    let mut body = response.bytes_stream();
    let mut buffer = Vec::new();

    loop {
        let chunk = tokio::select! {
            chunk = body.next() => match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            },
            _ = stop.cancelled() => return Ok(()),
        };

        buffer.extend_from_slice(&chunk);

        while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();
            let line = &line[..line.len() - 1];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match ClusterMap::parse(line, host) {
                Ok(map) => {
                    tracing::debug!(bucket = %bucket, rev = map.rev, "streamed config line");
                    let publish = ConfigPublish { map, source_host: host.to_string() };
                    if publisher.send(publish).await.is_err() {
                        return Ok(());
                    }
                }
                Err(e) => {
                    tracing::warn!(bucket = %bucket, error = %e, "skipping malformed config line");
                }
            }
        }
    }
}
