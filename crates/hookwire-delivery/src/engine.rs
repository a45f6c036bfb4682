//! Batch engine: wires the components together and runs one batch.
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌────────────────┐
//! │ EventCapture │──▶│ MessageProcessor │──▶│ DeliveryWorker │──▶ listeners
//! └──────────────┘   └──────────────────┘   └────────────────┘
//!                                                   ▲
//!                    ┌──────────────────┐           │
//!                    │   RetrySweeper   │───────────┘
//!                    └──────────────────┘
//! ```
//!
//! A batch holds a storage lease for its whole run so that overlapping
//! invocations (cron firing while a slow batch is still going) skip instead
//! of delivering the same tasks twice.

use std::{sync::Arc, time::Duration};

use hookwire_core::{Clock, EventHandler, SubjectResolver, WebhookRegistry};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    capture::EventCapture,
    client::{ClientConfig, DeliveryClient},
    error::Result,
    processor::{MessageProcessor, ProcessReport},
    storage::DeliveryStorage,
    sweeper::{RetrySweeper, SweepReport},
    worker::DeliveryWorker,
};

/// Default number of concurrent delivery attempts.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default batch lease lifetime.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(900);

const LEASE_NAME: &str = "hookwire-batch";

/// Configuration for the delivery engine.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Maximum simultaneous attempts within one fan-out or one sweep.
    pub concurrency: usize,

    /// How long a batch lease stays valid if its holder never releases it.
    pub lease_ttl: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            client_config: ClientConfig::default(),
            concurrency: DEFAULT_CONCURRENCY,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }
}

/// Summary of one batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// True when another process held the lease and nothing was done.
    pub skipped: bool,
    /// Message processing summary.
    pub processing: ProcessReport,
    /// Retry sweep summary.
    pub sweep: SweepReport,
}

impl BatchReport {
    /// True when some message references an unregistered subject type.
    pub fn has_unregistered_types(&self) -> bool {
        self.processing.unregistered() > 0
    }
}

/// Owns the capture, processing, delivery and sweeping components.
pub struct DeliveryEngine {
    storage: Arc<dyn DeliveryStorage>,
    clock: Arc<dyn Clock>,
    config: DeliveryConfig,
    holder: String,
    worker: DeliveryWorker,
    processor: MessageProcessor,
    sweeper: RetrySweeper,
    capture: EventCapture,
}

impl DeliveryEngine {
    /// Builds the engine.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the HTTP client cannot be built.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        subjects: Arc<dyn SubjectResolver>,
        registry: Arc<WebhookRegistry>,
        event_handler: Arc<dyn EventHandler>,
        clock: Arc<dyn Clock>,
        config: DeliveryConfig,
    ) -> Result<Self> {
        let client = DeliveryClient::new(config.client_config.clone())?;
        let worker = DeliveryWorker::new(
            storage.clone(),
            client,
            registry.clone(),
            event_handler.clone(),
            clock.clone(),
        );
        let processor = MessageProcessor::new(
            storage.clone(),
            subjects,
            registry.clone(),
            worker.clone(),
            clock.clone(),
            config.concurrency,
        );
        let sweeper = RetrySweeper::new(
            storage.clone(),
            registry.clone(),
            worker.clone(),
            event_handler,
            clock.clone(),
            config.concurrency,
        );
        let capture = EventCapture::new(storage.clone(), registry, processor.clone(), clock.clone());

        Ok(Self {
            storage,
            clock,
            config,
            holder: Uuid::new_v4().to_string(),
            worker,
            processor,
            sweeper,
            capture,
        })
    }

    /// Mutation entry point.
    pub fn capture(&self) -> &EventCapture {
        &self.capture
    }

    /// Message processor.
    pub fn processor(&self) -> &MessageProcessor {
        &self.processor
    }

    /// Retry sweeper.
    pub fn sweeper(&self) -> &RetrySweeper {
        &self.sweeper
    }

    /// Delivery worker.
    pub fn worker(&self) -> &DeliveryWorker {
        &self.worker
    }

    /// Runs one batch: pending messages first, then the retry sweep.
    ///
    /// # Errors
    ///
    /// Returns `Core` if the lease cannot be taken, the pending messages
    /// cannot be listed or a sweep selection fails.
    pub async fn run_once(&self) -> Result<BatchReport> {
        let acquired = self
            .storage
            .try_acquire_lease(
                LEASE_NAME.to_string(),
                self.holder.clone(),
                self.clock.now(),
                self.config.lease_ttl,
            )
            .await?;
        if !acquired {
            warn!("another batch holds the lease; skipping");
            return Ok(BatchReport { skipped: true, ..BatchReport::default() });
        }

        let result = self.run_batch().await;

        if let Err(error) = self.storage.release_lease(LEASE_NAME.to_string(), self.holder.clone()).await {
            warn!(error = %error, "failed to release batch lease");
        }

        let report = result?;
        info!(
            fanned_out = report.processing.fanned_out(),
            discarded = report.processing.discarded(),
            failed_messages = report.processing.failures.len(),
            tasks_created = report.processing.tasks_created(),
            delivered = report.processing.delivered() + report.sweep.delivered,
            retried = report.sweep.retried,
            failed_attempts = report.sweep.failed,
            exhausted = report.sweep.exhausted,
            "batch finished"
        );
        Ok(report)
    }

    async fn run_batch(&self) -> Result<BatchReport> {
        let processing = self.processor.process_pending().await?;
        let sweep = self.sweeper.sweep().await?;
        Ok(BatchReport { skipped: false, processing, sweep })
    }
}
