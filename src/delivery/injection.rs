use super::{Transport, TransportError, TransportKind, TransportReceipt};
use crate::queue::QueueEntry;
use crate::router::{DeliveryPlan, Recipient};
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Live input surface of a recipient process. Black box: either the text
/// was typed into the recipient's surface or it was not.
#[async_trait]
pub trait Injector: Send + Sync {
    fn name(&self) -> &str;

    async fn inject(&self, recipient: &Recipient, text: &str) -> anyhow::Result<()>;
}

/// Injector that runs an external helper per message.
///
/// The argv comes from `delivery.injection_command`; `{recipient}`, `{x}`
/// and `{y}` are substituted per recipient and the text is written to the
/// helper's stdin. A non-zero exit is a failed injection.
pub struct CommandInjector {
    argv: Vec<String>,
}

impl CommandInjector {
    pub fn new(argv: Vec<String>) -> anyhow::Result<Self> {
        if argv.first().is_none_or(|program| program.trim().is_empty()) {
            anyhow::bail!("injection command must name a program");
        }
        Ok(Self { argv })
    }

    fn expand(&self, recipient: &Recipient) -> Vec<String> {
        let (x, y) = recipient
            .coordinates
            .map_or((String::new(), String::new()), |c| {
                (c.x.to_string(), c.y.to_string())
            });
        self.argv
            .iter()
            .map(|arg| {
                arg.replace("{recipient}", &recipient.name)
                    .replace("{x}", &x)
                    .replace("{y}", &y)
            })
            .collect()
    }
}

#[async_trait]
impl Injector for CommandInjector {
    fn name(&self) -> &str {
        "command"
    }

    async fn inject(&self, recipient: &Recipient, text: &str) -> anyhow::Result<()> {
        let argv = self.expand(recipient);
        let (program, args) = argv
            .split_first()
            .context("injection command must name a program")?;

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn injection helper `{program}`"))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A helper may exit without reading stdin; its exit status decides.
            if let Err(e) = stdin.write_all(text.as_bytes()).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e).context("Failed to write message to injection helper");
                }
            }
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for injection helper")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "injection helper exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }
        Ok(())
    }
}

/// Transport over an [`Injector`], serialized per recipient because each
/// recipient has exactly one input surface.
pub struct InjectionTransport {
    injector: Arc<dyn Injector>,
    surfaces: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl InjectionTransport {
    pub fn new(injector: Arc<dyn Injector>) -> Self {
        Self {
            injector,
            surfaces: Mutex::new(HashMap::new()),
        }
    }

    fn surface_lock(&self, recipient: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.surfaces
                .lock()
                .entry(recipient.to_string())
                .or_default(),
        )
    }
}

#[async_trait]
impl Transport for InjectionTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Injection
    }

    async fn send(
        &self,
        entry: &QueueEntry,
        plan: &DeliveryPlan,
    ) -> Result<TransportReceipt, TransportError> {
        if plan.recipient.coordinates.is_none() {
            return Err(TransportError::unavailable(
                TransportKind::Injection,
                format!("no input surface known for {}", plan.recipient.name),
            ));
        }

        let surface = self.surface_lock(&plan.recipient.name);
        let _guard = surface.lock().await;
        self.injector
            .inject(&plan.recipient, &plan.formatted)
            .await
            .map_err(|e| {
                TransportError::unavailable(
                    TransportKind::Injection,
                    format!("{}: {e:#}", self.injector.name()),
                )
            })?;

        tracing::debug!(
            queue_id = %entry.queue_id,
            recipient = %plan.recipient.name,
            injector = self.injector.name(),
            "Message injected"
        );
        Ok(TransportReceipt {
            transport: TransportKind::Injection,
            location: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Coordinates;
    use crate::queue::{Message, MessageCategory};
    use chrono::Utc;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn plan(coordinates: Option<Coordinates>) -> DeliveryPlan {
        DeliveryPlan {
            recipient: Recipient {
                name: "Worker-1".into(),
                inbox_dir: PathBuf::from("/unused"),
                coordinates,
            },
            category: MessageCategory::AgentToAgent,
            transports: vec![TransportKind::Injection, TransportKind::Inbox],
            formatted: "hello".into(),
        }
    }

    fn entry() -> QueueEntry {
        QueueEntry::new(
            Message::new("Worker-2", "Worker-1", MessageCategory::AgentToAgent, "hello"),
            Utc::now(),
        )
    }

    /// Tracks the peak number of concurrent injections.
    #[derive(Default)]
    struct OverlapInjector {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Injector for OverlapInjector {
        fn name(&self) -> &str {
            "overlap"
        }

        async fn inject(&self, _recipient: &Recipient, _text: &str) -> anyhow::Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn injections_to_one_recipient_are_serialized() {
        let injector = Arc::new(OverlapInjector::default());
        let transport = Arc::new(InjectionTransport::new(injector.clone()));
        let coords = Some(Coordinates { x: 1, y: 2 });

        let mut handles = Vec::new();
        for _ in 0..4 {
            let transport = Arc::clone(&transport);
            handles.push(tokio::spawn(async move {
                transport.send(&entry(), &plan(coords)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(injector.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_coordinates_is_transient_unavailable() {
        let transport = InjectionTransport::new(Arc::new(OverlapInjector::default()));
        let err = transport.send(&entry(), &plan(None)).await.unwrap_err();
        assert!(matches!(err, TransportError::Unavailable { .. }));
        assert!(!err.is_permanent());
    }

    #[test]
    fn command_injector_expands_placeholders() {
        let injector = CommandInjector::new(vec![
            "inject".into(),
            "--target={recipient}".into(),
            "{x},{y}".into(),
        ])
        .unwrap();
        let recipient = Recipient {
            name: "Worker-1".into(),
            inbox_dir: PathBuf::new(),
            coordinates: Some(Coordinates { x: 5, y: -7 }),
        };
        assert_eq!(
            injector.expand(&recipient),
            vec!["inject", "--target=Worker-1", "5,-7"]
        );
        assert!(CommandInjector::new(Vec::new()).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_injector_reports_nonzero_exit() {
        let recipient = Recipient {
            name: "Worker-1".into(),
            inbox_dir: PathBuf::new(),
            coordinates: Some(Coordinates { x: 0, y: 0 }),
        };
        let ok = CommandInjector::new(vec!["sh".into(), "-c".into(), "cat >/dev/null".into()])
            .unwrap();
        ok.inject(&recipient, "hello").await.unwrap();

        let failing =
            CommandInjector::new(vec!["sh".into(), "-c".into(), "echo nope >&2; exit 3".into()])
                .unwrap();
        let err = failing.inject(&recipient, "hello").await.unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
