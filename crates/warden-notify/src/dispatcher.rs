use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use warden_access::PriorityOrder;
use warden_core::DecisionLedger;
use warden_runtime::ConcurrencyLimiter;

use crate::overrides::TargetOverrides;
use crate::plan::plan_notify_delivery;
use crate::request::NotifyRequest;

pub const NOTIFY_LIMITER_MODULE: &str = "notify";
pub const NOTIFY_SEND_FAILED_RECORD_TYPE: &str = "notify_send_failed";
const UNKNOWN_TARGET_ERROR: &str = "unknown_target";

/// Outbound transport for one target (platform adapter boundary).
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    fn target(&self) -> &str;
    async fn send(&self, chat_id: &str, text: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotifySendFailure {
    pub chat_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotifyDispatchReport {
    pub target: String,
    pub sent: Vec<String>,
    pub skipped: BTreeMap<String, &'static str>,
    pub failed: Vec<NotifySendFailure>,
}

/// Plans gate decisions, audits every one to the ledger and sends the
/// allowed ones through the registered channel under the limiter.
#[derive(Clone)]
pub struct NotifyDispatcher {
    channels: BTreeMap<String, Arc<dyn NotifyChannel>>,
    order: PriorityOrder,
    overrides: TargetOverrides,
    limiter: ConcurrencyLimiter,
    ledger: Option<DecisionLedger>,
}

impl NotifyDispatcher {
    pub fn new(order: PriorityOrder, overrides: TargetOverrides, limiter: ConcurrencyLimiter) -> Self {
        Self {
            channels: BTreeMap::new(),
            order,
            overrides,
            limiter,
            ledger: None,
        }
    }

    pub fn with_ledger(mut self, ledger: DecisionLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn register_channel(&mut self, channel: Arc<dyn NotifyChannel>) {
        self.channels
            .insert(channel.target().trim().to_string(), channel);
    }

    pub fn replace_overrides(&mut self, overrides: TargetOverrides) {
        self.overrides = overrides;
    }

    pub async fn dispatch(&self, request: &NotifyRequest) -> NotifyDispatchReport {
        let plan = plan_notify_delivery(request, &self.order, &self.overrides);
        let mut report = NotifyDispatchReport {
            target: plan.target.clone(),
            ..NotifyDispatchReport::default()
        };
        let channel = self.channels.get(&plan.target);

        for delivery in &plan.deliveries {
            self.record(&delivery.audit.to_value()).await;
            if let Some(reason) = delivery.decision.reason {
                tracing::debug!(
                    target_name = %plan.target,
                    chat_id = %delivery.chat_id,
                    reason = reason.as_str(),
                    "notification skipped by priority gate"
                );
                report
                    .skipped
                    .insert(delivery.chat_id.clone(), reason.as_str());
                continue;
            }

            let outcome = match channel {
                Some(channel) => self
                    .limiter
                    .run(
                        NOTIFY_LIMITER_MODULE,
                        channel.send(&delivery.chat_id, &request.text),
                    )
                    .await
                    .map_err(anyhow::Error::from)
                    .and_then(|sent| sent),
                None => Err(anyhow::anyhow!(UNKNOWN_TARGET_ERROR)),
            };
            match outcome {
                Ok(()) => report.sent.push(delivery.chat_id.clone()),
                Err(error) => {
                    let error = format!("{error:#}");
                    tracing::warn!(
                        target_name = %plan.target,
                        chat_id = %delivery.chat_id,
                        %error,
                        "notification send failed"
                    );
                    self.record(&json!({
                        "record_type": NOTIFY_SEND_FAILED_RECORD_TYPE,
                        "target": plan.target,
                        "chat_id": delivery.chat_id,
                        "error": error,
                    }))
                    .await;
                    report.failed.push(NotifySendFailure {
                        chat_id: delivery.chat_id.clone(),
                        error,
                    });
                }
            }
        }
        report
    }

    async fn record(&self, record: &serde_json::Value) {
        if let Some(ledger) = &self.ledger {
            ledger.append_or_warn(record).await;
        }
    }
}
