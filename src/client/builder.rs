use crate::adapter::managed::{Backend, ManagedAdapter};
use crate::adapter::AiAdapter;
use crate::client::core::RelayClient;
use crate::client::processor::QueryProcessor;
use crate::client::validation::ResponseValidator;
use crate::config::RelayConfig;
use crate::resilience::retry::RetryPolicy;
use crate::streaming::StreamHandler;
use crate::telemetry::{LoggedAdapter, Observer, TracingObserver};
use crate::Result;
use std::sync::Arc;

/// Builder for [`RelayClient`].
///
/// Keep this surface area small: everything else comes from [`RelayConfig`].
pub struct RelayClientBuilder {
    config: RelayConfig,
    observer: Arc<dyn Observer>,
    validator: ResponseValidator,
    query_policy: Option<RetryPolicy>,
    logging: bool,
}

impl RelayClientBuilder {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            observer: Arc::new(TracingObserver),
            validator: ResponseValidator::default(),
            query_policy: None,
            logging: true,
        }
    }

    /// Inject an observer. Default emits every event through `tracing`.
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_validator(mut self, validator: ResponseValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Override the query retry policy derived from `query_retry`.
    pub fn with_query_policy(mut self, policy: RetryPolicy) -> Self {
        self.query_policy = Some(policy);
        self
    }

    /// Wrap the adapter in a [`LoggedAdapter`] (on by default).
    pub fn with_logging(mut self, enable: bool) -> Self {
        self.logging = enable;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Build over a backend, with connection management from the config.
    pub fn build_with_backend<B: Backend>(self, backend: B) -> Result<RelayClient> {
        self.config.validate()?;
        let managed = ManagedAdapter::with_observer(backend, &self.config, self.observer.clone());
        let adapter: Arc<dyn AiAdapter> = if self.logging {
            Arc::new(LoggedAdapter::new(managed))
        } else {
            Arc::new(managed)
        };
        Ok(self.assemble(adapter))
    }

    /// Build over an adapter that manages its own connection.
    pub fn build_with_adapter(self, adapter: Arc<dyn AiAdapter>) -> Result<RelayClient> {
        self.config.validate()?;
        let adapter: Arc<dyn AiAdapter> = if self.logging {
            Arc::new(LoggedAdapter::new(adapter))
        } else {
            adapter
        };
        Ok(self.assemble(adapter))
    }

    /// Build over the bundled HTTP backend.
    #[cfg(feature = "http")]
    pub fn build(self) -> Result<RelayClient> {
        let backend = crate::backend::HttpBackend::from_config(&self.config.service)?;
        self.build_with_backend(backend)
    }

    fn assemble(self, adapter: Arc<dyn AiAdapter>) -> RelayClient {
        let policy = self
            .query_policy
            .unwrap_or_else(|| self.config.query_policy());
        let processor = QueryProcessor::new(adapter)
            .with_retry_policy(policy)
            .with_validator(self.validator)
            .with_observer(self.observer.clone());
        let streams = StreamHandler::new().with_observer(self.observer.clone());
        RelayClient::new(processor, streams, self.config.buffer.clone(), self.observer)
    }
}
