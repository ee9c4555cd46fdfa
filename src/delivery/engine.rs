use super::{
    CommandInjector, DeliveryError, InboxTransport, InjectionTransport, Transport, TransportError,
    TransportKind, TransportReceipt,
};
use crate::config::Config;
use crate::queue::QueueEntry;
use crate::router::DeliveryPlan;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

struct Slot {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

/// Successful delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Transport that delivered the message.
    pub transport: TransportKind,
    /// Inbox file written, either as the delivery itself or as the audit copy.
    pub inbox_file: Option<PathBuf>,
    /// Failures of transports tried before the one that succeeded.
    pub fallbacks: Vec<String>,
}

/// Runs a delivery plan: each transport under its own timeout, in order,
/// stopping at the first success.
pub struct DeliveryEngine {
    slots: HashMap<TransportKind, Slot>,
    audit_copy: bool,
}

impl Default for DeliveryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryEngine {
    /// Engine with no transports; add them with [`with_transport`](Self::with_transport).
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            audit_copy: false,
        }
    }

    /// Inbox transport always; injection through the configured helper when enabled.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let delivery = &config.delivery;
        let mut engine = Self::new()
            .with_transport(
                Arc::new(InboxTransport::new()),
                Duration::from_millis(delivery.inbox_timeout_ms),
            )
            .with_audit_copy(delivery.audit_copy);

        if delivery.injection_enabled {
            let injector = CommandInjector::new(delivery.injection_command.clone())?;
            engine = engine.with_transport(
                Arc::new(InjectionTransport::new(Arc::new(injector))),
                Duration::from_millis(delivery.injection_timeout_ms),
            );
        }
        Ok(engine)
    }

    /// Register (or replace) the transport for its kind.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        self.slots
            .insert(transport.kind(), Slot { transport, timeout });
        self
    }

    #[must_use]
    pub fn with_audit_copy(mut self, audit_copy: bool) -> Self {
        self.audit_copy = audit_copy;
        self
    }

    /// Upper bound on one `deliver` call: the sum of the planned transports' timeouts.
    pub fn budget(&self, plan: &DeliveryPlan) -> Duration {
        plan.transports
            .iter()
            .filter_map(|kind| self.slots.get(kind))
            .map(|slot| slot.timeout)
            .sum()
    }

    pub async fn deliver(
        &self,
        entry: &QueueEntry,
        plan: &DeliveryPlan,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        if plan.transports.is_empty() {
            return Err(DeliveryError::permanent("delivery plan has no transports"));
        }
        tracing::debug!(
            queue_id = %entry.queue_id,
            recipient = %plan.recipient.name,
            transports = plan.transports.len(),
            budget_ms = u64::try_from(self.budget(plan).as_millis()).unwrap_or(u64::MAX),
            "Delivering"
        );

        let mut failures: Vec<String> = Vec::new();
        let mut all_permanent = true;

        for kind in &plan.transports {
            let Some(slot) = self.slots.get(kind) else {
                failures.push(format!("{kind} not configured"));
                all_permanent = false;
                continue;
            };

            match run_slot(slot, entry, plan).await {
                Ok(receipt) => {
                    if !failures.is_empty() {
                        tracing::info!(
                            queue_id = %entry.queue_id,
                            recipient = %plan.recipient.name,
                            transport = %kind,
                            failed = failures.len(),
                            "Delivered via fallback transport"
                        );
                    }
                    let inbox_file = match receipt.location {
                        Some(path) => Some(path),
                        None => self.audit_copy(entry, plan, *kind).await,
                    };
                    return Ok(DeliveryReceipt {
                        transport: *kind,
                        inbox_file,
                        fallbacks: failures,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        queue_id = %entry.queue_id,
                        recipient = %plan.recipient.name,
                        transport = %kind,
                        permanent = err.is_permanent(),
                        error = %err,
                        "Transport attempt failed"
                    );
                    all_permanent &= err.is_permanent();
                    failures.push(err.to_string());
                }
            }
        }

        let detail = failures.join("; ");
        if all_permanent {
            Err(DeliveryError::permanent(detail))
        } else {
            Err(DeliveryError::transient(detail))
        }
    }

    /// Inbox record after a non-inbox delivery. Failure is logged, not fatal.
    async fn audit_copy(
        &self,
        entry: &QueueEntry,
        plan: &DeliveryPlan,
        delivered_by: TransportKind,
    ) -> Option<PathBuf> {
        if !self.audit_copy || delivered_by == TransportKind::Inbox {
            return None;
        }
        let slot = self.slots.get(&TransportKind::Inbox)?;
        match run_slot(slot, entry, plan).await {
            Ok(receipt) => receipt.location,
            Err(err) => {
                tracing::warn!(
                    queue_id = %entry.queue_id,
                    recipient = %plan.recipient.name,
                    error = %err,
                    "Audit copy to inbox failed"
                );
                None
            }
        }
    }
}

async fn run_slot(
    slot: &Slot,
    entry: &QueueEntry,
    plan: &DeliveryPlan,
) -> Result<TransportReceipt, TransportError> {
    match tokio::time::timeout(slot.timeout, slot.transport.send(entry, plan)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            transport: slot.transport.kind(),
            timeout_ms: u64::try_from(slot.timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Coordinates;
    use crate::delivery::Injector;
    use crate::queue::{Message, MessageCategory};
    use crate::router::Recipient;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct ScriptedInjector {
        fail: bool,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedInjector {
        fn new(fail: bool, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                fail,
                delay,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Injector for ScriptedInjector {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn inject(&self, _recipient: &Recipient, _text: &str) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                anyhow::bail!("surface not focused");
            }
            Ok(())
        }
    }

    struct RejectingTransport(TransportKind);

    #[async_trait]
    impl Transport for RejectingTransport {
        fn kind(&self) -> TransportKind {
            self.0
        }

        async fn send(
            &self,
            _entry: &QueueEntry,
            _plan: &DeliveryPlan,
        ) -> Result<TransportReceipt, TransportError> {
            Err(TransportError::rejected(self.0, "never"))
        }
    }

    fn entry() -> QueueEntry {
        QueueEntry::new(
            Message::new("Coordinator", "Worker-1", MessageCategory::CaptainToAgent, "go"),
            Utc::now(),
        )
    }

    fn plan(tmp: &TempDir, transports: Vec<TransportKind>) -> DeliveryPlan {
        DeliveryPlan {
            recipient: Recipient {
                name: "Worker-1".into(),
                inbox_dir: tmp.path().join("Worker-1").join("inbox"),
                coordinates: Some(Coordinates { x: 1, y: 1 }),
            },
            category: MessageCategory::CaptainToAgent,
            transports,
            formatted: "go\n".into(),
        }
    }

    fn engine(injector: Arc<ScriptedInjector>, injection_timeout: Duration) -> DeliveryEngine {
        DeliveryEngine::new()
            .with_transport(Arc::new(InboxTransport::new()), Duration::from_secs(5))
            .with_transport(
                Arc::new(InjectionTransport::new(injector)),
                injection_timeout,
            )
            .with_audit_copy(true)
    }

    #[tokio::test]
    async fn injection_success_still_writes_audit_copy() {
        let tmp = TempDir::new().unwrap();
        let injector = ScriptedInjector::new(false, Duration::ZERO);
        let engine = engine(injector.clone(), Duration::from_secs(1));
        let entry = entry();

        let receipt = engine
            .deliver(
                &entry,
                &plan(&tmp, vec![TransportKind::Injection, TransportKind::Inbox]),
            )
            .await
            .unwrap();
        assert_eq!(receipt.transport, TransportKind::Injection);
        assert!(receipt.inbox_file.unwrap().exists());
        assert_eq!(injector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_injection_falls_back_to_inbox() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(
            ScriptedInjector::new(true, Duration::ZERO),
            Duration::from_secs(1),
        );

        let receipt = engine
            .deliver(
                &entry(),
                &plan(&tmp, vec![TransportKind::Injection, TransportKind::Inbox]),
            )
            .await
            .unwrap();
        assert_eq!(receipt.transport, TransportKind::Inbox);
        assert_eq!(receipt.fallbacks.len(), 1);
        assert!(receipt.fallbacks[0].contains("surface not focused"));
    }

    #[tokio::test]
    async fn slow_injection_times_out_then_falls_back() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(
            ScriptedInjector::new(false, Duration::from_secs(5)),
            Duration::from_millis(20),
        );

        let receipt = engine
            .deliver(
                &entry(),
                &plan(&tmp, vec![TransportKind::Injection, TransportKind::Inbox]),
            )
            .await
            .unwrap();
        assert_eq!(receipt.transport, TransportKind::Inbox);
        assert!(receipt.fallbacks[0].contains("timed out"));
    }

    #[tokio::test]
    async fn all_permanent_failures_are_permanent() {
        let tmp = TempDir::new().unwrap();
        let engine = DeliveryEngine::new().with_transport(
            Arc::new(RejectingTransport(TransportKind::Inbox)),
            Duration::from_secs(1),
        );
        let err = engine
            .deliver(&entry(), &plan(&tmp, vec![TransportKind::Inbox]))
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn mixed_failures_are_transient() {
        let tmp = TempDir::new().unwrap();
        let engine = DeliveryEngine::new()
            .with_transport(
                Arc::new(RejectingTransport(TransportKind::Inbox)),
                Duration::from_secs(1),
            )
            .with_transport(
                Arc::new(InjectionTransport::new(ScriptedInjector::new(
                    true,
                    Duration::ZERO,
                ))),
                Duration::from_secs(1),
            );
        let err = engine
            .deliver(
                &entry(),
                &plan(&tmp, vec![TransportKind::Injection, TransportKind::Inbox]),
            )
            .await
            .unwrap_err();
        assert!(!err.is_permanent());
    }

    #[test]
    fn budget_sums_planned_timeouts() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(
            ScriptedInjector::new(false, Duration::ZERO),
            Duration::from_secs(2),
        );
        assert_eq!(
            engine.budget(&plan(&tmp, vec![TransportKind::Injection, TransportKind::Inbox])),
            Duration::from_secs(7)
        );
        assert_eq!(
            engine.budget(&plan(&tmp, vec![TransportKind::Inbox])),
            Duration::from_secs(5)
        );
    }
}
