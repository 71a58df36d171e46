// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Endpoints: ordered stages sharing one state type and one reply type.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::context::ProcessContext;
use crate::error::{MatsError, Result};
use crate::factory::MatsFactory;
use crate::stage::{MatsStage, ReplyingStage, StageHandler, StageInfo, TypedStage};
use crate::trace::MessagingModel;

/// Id of stage `index` of `endpoint_id`: the endpoint id itself for the first
/// stage, `<endpoint_id>.stage<index>` for the rest.
pub fn stage_id(endpoint_id: &str, index: usize) -> String {
    if index == 0 {
        endpoint_id.to_string()
    } else {
        format!("{endpoint_id}.stage{index}")
    }
}

#[derive(Debug)]
pub struct MatsEndpoint {
    endpoint_id: String,
    subscription: bool,
    stages: Vec<Arc<MatsStage>>,
}

impl MatsEndpoint {
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// Subscription endpoints consume from a topic with one processor per node.
    pub fn is_subscription(&self) -> bool {
        self.subscription
    }

    pub fn stages(&self) -> &[Arc<MatsStage>] {
        &self.stages
    }

    pub fn stage(&self, stage_id: &str) -> Option<&Arc<MatsStage>> {
        self.stages.iter().find(|s| s.stage_id() == stage_id)
    }

    pub fn is_running(&self) -> bool {
        self.stages.iter().any(|s| s.is_running())
    }

    pub fn start(&self) {
        info!(endpoint_id = %self.endpoint_id, "Starting endpoint");
        for stage in &self.stages {
            stage.start();
        }
    }

    /// Stops every stage; `graceful` is the budget for the whole endpoint.
    pub fn stop(&self, graceful: Duration) -> bool {
        let deadline = Instant::now() + graceful;
        let mut clean = true;
        for stage in &self.stages {
            clean &= stage.stop(deadline.saturating_duration_since(Instant::now()));
        }
        clean
    }

    /// Waits until every stage has a consumer in place.
    pub fn wait_for_receiving(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.stages
            .iter()
            .all(|s| s.wait_for_receiving(deadline.saturating_duration_since(Instant::now())))
    }
}

/// Builds a multi-stage endpoint with reply type `R` and state type `S`.
#[must_use = "an endpoint is only registered by last_stage(..) or finish_setup()"]
pub struct EndpointBuilder<'f, R, S> {
    factory: &'f MatsFactory,
    endpoint_id: String,
    subscription: bool,
    concurrency: Option<usize>,
    handlers: Vec<Arc<dyn StageHandler>>,
    _types: PhantomData<fn() -> (R, S)>,
}

impl<'f, R, S> EndpointBuilder<'f, R, S>
where
    R: 'static,
    S: Serialize + DeserializeOwned + Default + 'static,
{
    pub(crate) fn new(factory: &'f MatsFactory, endpoint_id: &str, subscription: bool) -> Self {
        Self {
            factory,
            endpoint_id: endpoint_id.to_string(),
            subscription,
            concurrency: subscription.then_some(1),
            handlers: Vec::new(),
            _types: PhantomData,
        }
    }

    /// Processors per stage; ignored for subscription endpoints, which always use one.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        if !self.subscription {
            self.concurrency = Some(concurrency.max(1));
        }
        self
    }

    /// Adds a stage that continues with `ctx.next(..)`, `ctx.request(..)`, or replies explicitly.
    pub fn stage<I, F>(mut self, lambda: F) -> Self
    where
        I: DeserializeOwned + 'static,
        F: Fn(&mut ProcessContext<'_, R>, &mut S, I) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .push(Arc::new(TypedStage::<R, S, I, F>::new(lambda)));
        self
    }

    /// Adds the last stage, whose return value is the endpoint's reply, and registers the endpoint.
    pub fn last_stage<I, F>(mut self, lambda: F) -> Result<Arc<MatsEndpoint>>
    where
        R: Serialize,
        I: DeserializeOwned + 'static,
        F: Fn(&mut ProcessContext<'_, R>, &mut S, I) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        self.handlers
            .push(Arc::new(ReplyingStage::<R, S, I, F>::new(lambda)));
        self.finish_setup()
    }

    /// Registers the endpoint with the stages added so far.
    pub fn finish_setup(self) -> Result<Arc<MatsEndpoint>> {
        if self.handlers.is_empty() {
            return Err(MatsError::NoStages(self.endpoint_id));
        }
        let shared = self.factory.shared();
        let concurrency = self.concurrency.unwrap_or(shared.config.concurrency);
        let count = self.handlers.len();
        let stages = self
            .handlers
            .into_iter()
            .enumerate()
            .map(|(index, handler)| {
                let model = if self.subscription && index == 0 {
                    MessagingModel::Topic
                } else {
                    MessagingModel::Queue
                };
                let info = StageInfo {
                    endpoint_id: self.endpoint_id.clone(),
                    stage_id: stage_id(&self.endpoint_id, index),
                    next_stage_id: (index + 1 < count)
                        .then(|| stage_id(&self.endpoint_id, index + 1)),
                    model,
                    subscription: self.subscription,
                };
                Arc::new(MatsStage::new(info, handler, shared.clone(), concurrency))
            })
            .collect();

        let endpoint = Arc::new(MatsEndpoint {
            endpoint_id: self.endpoint_id,
            subscription: self.subscription,
            stages,
        });
        self.factory.register(endpoint.clone())?;
        Ok(endpoint)
    }
}
