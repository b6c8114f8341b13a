//! Async facade for tokio callers
//!
//! The interface blocks its caller while waiting for the adapter, so every
//! call runs on tokio's blocking pool.

use crate::error::{ElmError, Result};
use crate::interface::ElmInterface;
use crate::protocol::AdapterKind;
use crate::stream::ElmStream;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Tokio wrapper around [`ElmInterface`]
pub struct AsyncElmClient<S: ElmStream + 'static> {
    inner: Arc<ElmInterface<S>>,
}

impl<S: ElmStream + 'static> Clone for AsyncElmClient<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: ElmStream + 'static> AsyncElmClient<S> {
    pub fn new(interface: ElmInterface<S>) -> Self {
        Self {
            inner: Arc::new(interface),
        }
    }

    /// Underlying synchronous interface
    pub fn interface(&self) -> &ElmInterface<S> {
        &self.inner
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ElmInterface<S>) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|err| ElmError::Task(err.to_string()))?
    }

    /// Run the adapter init handshake
    pub async fn init(&self) -> Result<AdapterKind> {
        self.blocking(|interface| interface.init()).await
    }

    /// Send one BMW-FAST request and wait for the response telegram (checksum removed)
    pub async fn exchange(&self, request: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        debug!("Exchanging {} byte request", request.len());
        self.blocking(move |interface| {
            interface.send_data(&request)?;
            interface.receive_telegram(timeout)
        })
        .await
    }

    /// Stop the worker thread
    pub async fn disconnect(&self) -> Result<()> {
        self.blocking(|interface| interface.disconnect()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ElmConfig;
    use crate::mock::MockStream;

    #[tokio::test]
    async fn test_async_exchange() {
        let mock = MockStream::elm327();
        mock.on_can(|_, data| match data {
            [0x12, 0x02, 0x1A, 0x80, ..] => vec!["612F1025A80".to_string()],
            _ => Vec::new(),
        });
        let config = ElmConfig {
            command_timeout_ms: 200,
            poll_interval_ms: 1,
            ..ElmConfig::default()
        };
        let client = AsyncElmClient::new(ElmInterface::new(mock, config));

        assert_eq!(client.init().await.unwrap(), AdapterKind::Standard);
        let response = client
            .exchange(vec![0x82, 0x12, 0xF1, 0x1A, 0x80], Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(response, vec![0x82, 0xF1, 0x12, 0x5A, 0x80]);
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_async_send_before_init() {
        let interface = ElmInterface::new(MockStream::elm327(), ElmConfig::default());
        let client = AsyncElmClient::new(interface);
        let result = client.exchange(vec![0x81, 0x12, 0xF1, 0x3E], Duration::from_millis(10)).await;
        assert!(matches!(result, Err(ElmError::NotInitialized)));
    }
}
