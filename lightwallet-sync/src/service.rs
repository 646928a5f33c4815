//! Streaming block service: the remote node as seen by the sync engine.
//!
//! [`BlockService`] is the seam between the pipeline and the network. The
//! production implementation, [`LightwalletdService`], speaks gRPC to a
//! lightwalletd server. Implementations never retry internally; failures are
//! returned to the processor, which owns the retry policy.

use crate::proto_types::{self, compact_tx_streamer_client::CompactTxStreamerClient};
use crate::types::{
    BlockHeight, BlockRange, CompactBlock, RawTransaction, SubmitResult, TxId, UnspentOutput,
};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info};

/// Ordered, finite stream of compact blocks
pub type BlockStream = BoxStream<'static, Result<CompactBlock>>;

/// Remote block source
#[async_trait]
pub trait BlockService: Send + Sync {
    /// Current chain tip height
    async fn latest_block_height(&self) -> Result<BlockHeight>;

    /// Blocks in `range`, ascending. The stream is lazy: no request is made
    /// until it is first polled, and dropping it cancels the subscription.
    fn block_stream(&self, range: BlockRange) -> BlockStream;

    /// Broadcast a raw transaction
    async fn submit(&self, raw_tx: &[u8]) -> Result<SubmitResult>;

    /// Full transaction by id
    async fn fetch_transaction(&self, txid: &TxId) -> Result<RawTransaction>;

    /// Transparent UTXOs for `addresses` mined at or above `start_height`
    async fn fetch_utxos(
        &self,
        addresses: &[String],
        start_height: BlockHeight,
    ) -> Result<Vec<UnspentOutput>>;
}

/// Lightwalletd endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LightwalletdConfig {
    /// Server URL; `https://` enables TLS
    pub endpoint: String,
    /// Optional TLS server name override (SNI)
    pub tls_server_name: Option<String>,
    /// Connection establishment timeout
    pub connect_timeout_ms: u64,
    /// Deadline for each unary call
    pub single_call_timeout_ms: u64,
    /// Maximum wait for the next message of a block stream
    pub streaming_call_timeout_ms: u64,
}

impl Default for LightwalletdConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://mainnet.lightwalletd.com:9067".to_string(),
            tls_server_name: None,
            connect_timeout_ms: 30_000,
            single_call_timeout_ms: 10_000,
            streaming_call_timeout_ms: 100_000,
        }
    }
}

impl LightwalletdConfig {
    /// Config for `endpoint` with default timeouts
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    fn tls_enabled(&self) -> bool {
        self.endpoint.starts_with("https://")
    }

    fn single_call_timeout(&self) -> Duration {
        Duration::from_millis(self.single_call_timeout_ms)
    }

    fn streaming_call_timeout(&self) -> Duration {
        Duration::from_millis(self.streaming_call_timeout_ms)
    }
}

/// gRPC client for a lightwalletd server. Clones share one channel.
#[derive(Clone)]
pub struct LightwalletdService {
    config: LightwalletdConfig,
    channel: Arc<Mutex<Option<Channel>>>,
}

impl LightwalletdService {
    /// Create a client; the connection is established on first use
    pub fn new(config: LightwalletdConfig) -> Self {
        Self {
            config,
            channel: Arc::new(Mutex::new(None)),
        }
    }

    /// Endpoint configuration
    pub fn config(&self) -> &LightwalletdConfig {
        &self.config
    }

    /// Drop the cached channel; the next call reconnects
    pub async fn disconnect(&self) {
        *self.channel.lock().await = None;
        info!("Disconnected from lightwalletd");
    }

    /// Server version and chain info
    pub async fn lightd_info(&self) -> Result<proto_types::LightdInfo> {
        let mut client = self.client().await?;
        let response = self
            .single_call(client.get_lightd_info(proto_types::Empty {}))
            .await?;
        Ok(response.into_inner())
    }

    async fn client(&self) -> Result<CompactTxStreamerClient<Channel>> {
        let mut guard = self.channel.lock().await;
        if let Some(channel) = guard.as_ref() {
            return Ok(CompactTxStreamerClient::new(channel.clone()));
        }
        let channel = self.connect().await?;
        *guard = Some(channel.clone());
        Ok(CompactTxStreamerClient::new(channel))
    }

    async fn connect(&self) -> Result<Channel> {
        let url = &self.config.endpoint;
        debug!("Connecting to {}", url);

        let mut endpoint = Endpoint::from_shared(url.clone())
            .map_err(|e| Error::Config(format!("Invalid endpoint URL '{}': {}", url, e)))?
            .connect_timeout(Duration::from_millis(self.config.connect_timeout_ms));

        if self.config.tls_enabled() {
            let mut tls = ClientTlsConfig::new().with_webpki_roots();
            if let Some(name) = self.config.tls_server_name.as_ref() {
                tls = tls.domain_name(name.clone());
            } else if let Some(host) = extract_host(url) {
                tls = tls.domain_name(host);
            }
            endpoint = endpoint.tls_config(tls)?;
        }

        let channel = endpoint.connect().await?;
        info!("Connected to lightwalletd at {}", url);
        Ok(channel)
    }

    async fn single_call<F, T>(&self, call: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, tonic::Status>>,
    {
        match tokio::time::timeout(self.config.single_call_timeout(), call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout(format!(
                "call exceeded {} ms",
                self.config.single_call_timeout_ms
            ))),
        }
    }

    async fn open_block_stream(
        &self,
        range: BlockRange,
    ) -> Result<tonic::codec::Streaming<proto_types::CompactBlock>> {
        let mut client = self.client().await?;
        let request = proto_types::BlockRange {
            start: Some(proto_types::BlockId {
                height: range.lower(),
                hash: Vec::new(),
            }),
            end: Some(proto_types::BlockId {
                height: range.upper(),
                hash: Vec::new(),
            }),
        };
        let response = self.single_call(client.get_block_range(request)).await?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl BlockService for LightwalletdService {
    async fn latest_block_height(&self) -> Result<BlockHeight> {
        let mut client = self.client().await?;
        let response = self
            .single_call(client.get_latest_block(proto_types::ChainSpec {}))
            .await?;
        Ok(response.into_inner().height)
    }

    fn block_stream(&self, range: BlockRange) -> BlockStream {
        let message_timeout = self.config.streaming_call_timeout();
        let timeout_ms = self.config.streaming_call_timeout_ms;
        let opener = self.clone();

        stream::once(async move {
            let streaming = opener.open_block_stream(range).await?;
            let blocks = stream::unfold(Some(streaming), move |state| async move {
                let mut streaming = state?;
                match tokio::time::timeout(message_timeout, streaming.message()).await {
                    Ok(Ok(Some(block))) => Some((Ok(CompactBlock::from(block)), Some(streaming))),
                    Ok(Ok(None)) => None,
                    Ok(Err(status)) => Some((Err(Error::Status(status)), None)),
                    Err(_) => Some((
                        Err(Error::Timeout(format!(
                            "no block within {} ms",
                            timeout_ms
                        ))),
                        None,
                    )),
                }
            });
            Ok::<_, Error>(blocks)
        })
        .try_flatten()
        .boxed()
    }

    async fn submit(&self, raw_tx: &[u8]) -> Result<SubmitResult> {
        let mut client = self.client().await?;
        let response = self
            .single_call(client.send_transaction(proto_types::RawTransaction {
                data: raw_tx.to_vec(),
                height: 0,
            }))
            .await?
            .into_inner();
        Ok(SubmitResult {
            code: response.error_code,
            message: response.error_message,
        })
    }

    async fn fetch_transaction(&self, txid: &TxId) -> Result<RawTransaction> {
        let mut client = self.client().await?;
        let response = self
            .single_call(client.get_transaction(proto_types::TxFilter {
                block: None,
                index: 0,
                hash: txid.0.clone(),
            }))
            .await?
            .into_inner();
        Ok(RawTransaction {
            data: response.data,
            height: match response.height {
                0 => None,
                h => Some(h),
            },
        })
    }

    async fn fetch_utxos(
        &self,
        addresses: &[String],
        start_height: BlockHeight,
    ) -> Result<Vec<UnspentOutput>> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let mut client = self.client().await?;
        let response = self
            .single_call(client.get_address_utxos(proto_types::GetAddressUtxosArg {
                addresses: addresses.to_vec(),
                start_height,
                max_entries: 0,
            }))
            .await?
            .into_inner();
        Ok(response
            .address_utxos
            .into_iter()
            .map(|u| UnspentOutput {
                address: u.address,
                txid: u.txid,
                index: u.index.max(0) as u32,
                script: u.script,
                value_zat: u.value_zat,
                height: u.height,
            })
            .collect())
    }
}

/// Host part of an `scheme://host:port/path` URL
fn extract_host(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = rest.split('/').next()?;
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    (!host.is_empty()).then(|| host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_host() {
        assert_eq!(
            extract_host("https://mainnet.lightwalletd.com:9067"),
            Some("mainnet.lightwalletd.com".to_string())
        );
        assert_eq!(extract_host("http://127.0.0.1:9067/"), Some("127.0.0.1".to_string()));
        assert_eq!(extract_host("https://[::1]:443"), Some("::1".to_string()));
        assert_eq!(extract_host("https://"), None);
    }

    #[test]
    fn test_config_defaults() {
        let config = LightwalletdConfig::new("http://localhost:9067");
        assert!(!config.tls_enabled());
        assert_eq!(config.single_call_timeout(), Duration::from_secs(10));
        assert_eq!(config.streaming_call_timeout(), Duration::from_secs(100));
        assert!(LightwalletdConfig::default().tls_enabled());
    }

    #[tokio::test]
    async fn test_invalid_endpoint_is_configuration_error() {
        let service = LightwalletdService::new(LightwalletdConfig::new("not a url"));
        let err = service.latest_block_height().await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_block_stream_is_lazy() {
        let service = LightwalletdService::new(LightwalletdConfig::new("not a url"));
        // building the stream performs no I/O; the error surfaces on first poll
        let mut stream = service.block_stream(BlockRange::new(1, 2).unwrap());
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(Error::Config(_))));
        assert!(stream.next().await.is_none());
    }
}
