//! Consumer linking
//!
//! Attaches a published version to a consumer. The new link list is
//! computed by the version's resource kind; the store is only written when
//! that list differs from what the consumer already holds.

use serde::Serialize;
use tracing::{debug, info};

use lambda_venv_store::{RemoteStore, StoreOp, StoreResult};

use crate::registry::PublishedVersion;
use crate::retry::{CallContext, RetryPolicy};

/// Result of linking one consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerLink {
    pub consumer_id: String,
    pub version_ref: String,
    /// Whether the consumer's links were updated
    pub changed: bool,
    /// Links held after the call
    pub links: Vec<String>,
}

/// Attaches versions to consumers
pub struct Linker<'a> {
    store: &'a dyn RemoteStore,
    retry: &'a RetryPolicy,
}

impl<'a> Linker<'a> {
    pub fn new(store: &'a dyn RemoteStore, retry: &'a RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn link(
        &self,
        consumer_id: &str,
        version: &PublishedVersion,
        ctx: &CallContext,
    ) -> StoreResult<ConsumerLink> {
        let current = self.retry.run(ctx, StoreOp::ConsumerLinks, |_| {
            self.store.consumer_links(consumer_id)
        })?;
        let links = version.kind.apply_link(&current, &version.version_ref);

        if links == current {
            debug!(
                consumer = consumer_id,
                version_ref = %version.version_ref,
                "consumer already linked"
            );
            return Ok(ConsumerLink {
                consumer_id: consumer_id.to_string(),
                version_ref: version.version_ref.clone(),
                changed: false,
                links,
            });
        }

        self.retry.run(ctx, StoreOp::UpdateConsumerLinks, |_| {
            self.store.update_consumer_links(consumer_id, &links)
        })?;
        info!(
            consumer = consumer_id,
            version_ref = %version.version_ref,
            "consumer linked"
        );

        Ok(ConsumerLink {
            consumer_id: consumer_id.to_string(),
            version_ref: version.version_ref.clone(),
            changed: true,
            links,
        })
    }
}
