// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The factory: owner of endpoints and initiators on top of one broker.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mats_core::{FactoryConfig, InMemoryBroker, MatsFactory};
//!
//! let factory = MatsFactory::builder()
//!     .broker(Arc::new(InMemoryBroker::new()))
//!     .config(FactoryConfig::from_env()?)
//!     .build()?;
//!
//! factory.single("Calc.double", |_ctx, n: i64| Ok(n * 2))?;
//! factory.start();
//!
//! factory.default_initiator().initiate(|init| {
//!     init.trace_id("double-it")
//!         .from("main")
//!         .to("Calc.double")
//!         .send(&21)?;
//!     Ok(())
//! })?;
//!
//! // Graceful shutdown
//! factory.stop(std::time::Duration::from_secs(5));
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::broker::{Destination, MessageBroker};
use crate::config::FactoryConfig;
use crate::context::{NoReply, ProcessContext};
use crate::endpoint::{EndpointBuilder, MatsEndpoint};
use crate::error::{MatsError, Result};
use crate::initiate::MatsInitiator;
use crate::serializer::{JsonMatsSerializer, MatsSerializer};
use crate::trace::{CallDebugInfo, Channel};
use crate::transaction::{ExternalResource, TransactionManager};

const DEFAULT_INITIATOR: &str = "default";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Everything stage processors and initiators need from their factory.
pub(crate) struct FactoryShared {
    pub(crate) config: FactoryConfig,
    pub(crate) broker: Arc<dyn MessageBroker>,
    pub(crate) serializer: Arc<dyn MatsSerializer>,
    pub(crate) transactions: TransactionManager,
}

impl FactoryShared {
    pub(crate) fn debug_info(&self) -> CallDebugInfo {
        CallDebugInfo {
            app_name: self.config.app_name.clone(),
            app_version: self.config.app_version.clone(),
            host: self.config.nodename.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            debug_info: None,
        }
    }

    /// Broker destination for a channel: the configured prefix plus the channel id.
    pub(crate) fn destination_for(&self, channel: &Channel) -> Destination {
        Destination::new(
            format!("{}{}", self.config.destination_prefix, channel.id),
            channel.model,
        )
    }
}

/// Builder for creating a [`MatsFactory`].
#[derive(Default)]
pub struct MatsFactoryBuilder {
    broker: Option<Arc<dyn MessageBroker>>,
    resource: Option<Arc<dyn ExternalResource>>,
    serializer: Option<Arc<dyn MatsSerializer>>,
    config: FactoryConfig,
}

impl std::fmt::Debug for MatsFactoryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatsFactoryBuilder")
            .field("broker", &self.broker.as_ref().map(|_| "..."))
            .field("resource", &self.resource.as_ref().map(|r| r.name()))
            .field("serializer", &self.serializer.as_ref().map(|_| "..."))
            .field("config", &self.config)
            .finish()
    }
}

impl MatsFactoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the message broker (required).
    pub fn broker(mut self, broker: Arc<dyn MessageBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Set an external resource (e.g. a database) to enlist in every stage and
    /// initiation transaction.
    pub fn resource(mut self, resource: Arc<dyn ExternalResource>) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Replace the trace serializer.
    ///
    /// Default: [`JsonMatsSerializer`]
    pub fn serializer(mut self, serializer: Arc<dyn MatsSerializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn config(mut self, config: FactoryConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the factory. Returns an error if no broker was given.
    pub fn build(self) -> Result<MatsFactory> {
        let broker = self
            .broker
            .ok_or_else(|| MatsError::Configuration("broker is required".to_string()))?;
        if self.config.trace_key.is_empty() {
            return Err(MatsError::Configuration(
                "trace key must not be empty".to_string(),
            ));
        }

        Ok(MatsFactory {
            shared: Arc::new(FactoryShared {
                config: self.config,
                broker,
                serializer: self
                    .serializer
                    .unwrap_or_else(|| Arc::new(JsonMatsSerializer)),
                transactions: TransactionManager::new(self.resource),
            }),
            endpoints: Mutex::new(BTreeMap::new()),
            initiators: Mutex::new(BTreeMap::new()),
            started: AtomicBool::new(false),
        })
    }
}

/// Owns the endpoints and initiators of one application on one broker.
///
/// Endpoints created before [`start`](Self::start) wait for it; endpoints
/// created after start immediately. Dropping a started factory stops it with
/// the configured graceful budget.
pub struct MatsFactory {
    shared: Arc<FactoryShared>,
    endpoints: Mutex<BTreeMap<String, Arc<MatsEndpoint>>>,
    initiators: Mutex<BTreeMap<String, Arc<MatsInitiator>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for MatsFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatsFactory")
            .field("name", &self.shared.config.name)
            .field("endpoints", &lock(&self.endpoints).keys().collect::<Vec<_>>())
            .field("started", &self.is_started())
            .finish()
    }
}

impl MatsFactory {
    pub fn builder() -> MatsFactoryBuilder {
        MatsFactoryBuilder::new()
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.shared.config
    }

    pub(crate) fn shared(&self) -> &Arc<FactoryShared> {
        &self.shared
    }

    /// A single-stage endpoint replying with the lambda's return value.
    pub fn single<R, I, F>(&self, endpoint_id: &str, lambda: F) -> Result<Arc<MatsEndpoint>>
    where
        R: Serialize + 'static,
        I: DeserializeOwned + 'static,
        F: Fn(&mut ProcessContext<'_, R>, I) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        self.staged::<R, ()>(endpoint_id)
            .last_stage(move |ctx, _state: &mut (), dto: I| lambda(ctx, dto))
    }

    /// A multi-stage endpoint; add stages on the returned builder.
    pub fn staged<R, S>(&self, endpoint_id: &str) -> EndpointBuilder<'_, R, S>
    where
        R: 'static,
        S: Serialize + DeserializeOwned + Default + 'static,
    {
        EndpointBuilder::new(self, endpoint_id, false)
    }

    /// A single-stage endpoint that never replies, typically the `replyTo` of an initiation.
    pub fn terminator<S, I, F>(&self, endpoint_id: &str, lambda: F) -> Result<Arc<MatsEndpoint>>
    where
        S: Serialize + DeserializeOwned + Default + 'static,
        I: DeserializeOwned + 'static,
        F: Fn(&mut ProcessContext<'_, NoReply>, &mut S, I) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.staged::<NoReply, S>(endpoint_id)
            .stage(lambda)
            .finish_setup()
    }

    /// Like [`terminator`](Self::terminator), but consuming from a topic with a
    /// single processor, so every node gets every published message.
    pub fn subscription_terminator<S, I, F>(&self, endpoint_id: &str, lambda: F) -> Result<Arc<MatsEndpoint>>
    where
        S: Serialize + DeserializeOwned + Default + 'static,
        I: DeserializeOwned + 'static,
        F: Fn(&mut ProcessContext<'_, NoReply>, &mut S, I) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        EndpointBuilder::<NoReply, S>::new(self, endpoint_id, true)
            .stage(lambda)
            .finish_setup()
    }

    pub(crate) fn register(&self, endpoint: Arc<MatsEndpoint>) -> Result<()> {
        {
            let mut endpoints = lock(&self.endpoints);
            if endpoints.contains_key(endpoint.endpoint_id()) {
                return Err(MatsError::DuplicateEndpoint(
                    endpoint.endpoint_id().to_string(),
                ));
            }
            endpoints.insert(endpoint.endpoint_id().to_string(), endpoint.clone());
        }
        info!(
            endpoint_id = %endpoint.endpoint_id(),
            stages = endpoint.stages().len(),
            subscription = endpoint.is_subscription(),
            "Registered endpoint"
        );
        if self.is_started() {
            endpoint.start();
        }
        Ok(())
    }

    pub fn endpoint(&self, endpoint_id: &str) -> Option<Arc<MatsEndpoint>> {
        lock(&self.endpoints).get(endpoint_id).cloned()
    }

    pub fn endpoints(&self) -> Vec<Arc<MatsEndpoint>> {
        lock(&self.endpoints).values().cloned().collect()
    }

    /// Returns the initiator with this name, creating it on first use.
    pub fn get_or_create_initiator(&self, name: &str) -> Arc<MatsInitiator> {
        lock(&self.initiators)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MatsInitiator::new(name.to_string(), self.shared.clone())))
            .clone()
    }

    pub fn default_initiator(&self) -> Arc<MatsInitiator> {
        self.get_or_create_initiator(DEFAULT_INITIATOR)
    }

    /// Starts every registered endpoint; endpoints registered later start right away.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let endpoints = self.endpoints();
        info!(
            factory = %self.shared.config.name,
            endpoints = endpoints.len(),
            "Starting MatsFactory"
        );
        for endpoint in endpoints {
            endpoint.start();
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Stops all endpoints and closes the initiators. Returns `true` if every
    /// processor exited within `graceful`.
    pub fn stop(&self, graceful: Duration) -> bool {
        self.started.store(false, Ordering::SeqCst);
        info!(factory = %self.shared.config.name, "Stopping MatsFactory");
        let deadline = Instant::now() + graceful;
        let mut clean = true;
        for endpoint in self.endpoints() {
            clean &= endpoint.stop(deadline.saturating_duration_since(Instant::now()));
        }
        for initiator in lock(&self.initiators).values() {
            initiator.close();
        }
        info!(factory = %self.shared.config.name, clean, "MatsFactory stopped");
        clean
    }

    /// Waits until every stage of every endpoint has a consumer in place.
    pub fn wait_for_receiving(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.endpoints()
            .iter()
            .all(|e| e.wait_for_receiving(deadline.saturating_duration_since(Instant::now())))
    }
}

impl Drop for MatsFactory {
    fn drop(&mut self) {
        if self.is_started() {
            self.stop(self.shared.config.graceful_shutdown);
        }
    }
}
