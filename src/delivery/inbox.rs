use super::{Transport, TransportError, TransportKind, TransportReceipt};
use crate::queue::QueueEntry;
use crate::router::DeliveryPlan;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// File drop into the recipient's inbox directory, one file per queue entry.
///
/// The file is named after `queue_id`, so a retry of the same entry
/// overwrites its earlier drop instead of adding a second one. Writes go to a
/// hidden temp file first and are renamed into place, so readers never see a
/// partial message.
#[derive(Debug, Clone, Default)]
pub struct InboxTransport;

impl InboxTransport {
    pub fn new() -> Self {
        Self
    }

    pub fn file_path(inbox_dir: &Path, queue_id: &str) -> PathBuf {
        inbox_dir.join(format!("{queue_id}.md"))
    }

    fn render(entry: &QueueEntry, plan: &DeliveryPlan) -> String {
        let message = &entry.message;
        let mut out = String::new();
        out.push_str("---\n");
        out.push_str(&format!("queue_id: {}\n", entry.queue_id));
        out.push_str(&format!("message_id: {}\n", message.id));
        out.push_str(&format!("sender: {}\n", message.sender));
        out.push_str(&format!("recipient: {}\n", message.recipient));
        out.push_str(&format!("category: {}\n", message.category));
        out.push_str(&format!("priority: {}\n", message.priority));
        if let Some(task_id) = &message.task_id {
            out.push_str(&format!("task_id: {task_id}\n"));
        }
        out.push_str(&format!("created_at: {}\n", message.created_at.to_rfc3339()));
        out.push_str("---\n\n");
        out.push_str(&plan.formatted);
        out
    }
}

fn is_safe_file_stem(queue_id: &str) -> bool {
    !queue_id.is_empty()
        && queue_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}

#[async_trait]
impl Transport for InboxTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Inbox
    }

    async fn send(
        &self,
        entry: &QueueEntry,
        plan: &DeliveryPlan,
    ) -> Result<TransportReceipt, TransportError> {
        if !is_safe_file_stem(&entry.queue_id) {
            return Err(TransportError::rejected(
                TransportKind::Inbox,
                format!("queue id `{}` is not usable as a file name", entry.queue_id),
            ));
        }

        let io_err = |source| TransportError::Io {
            transport: TransportKind::Inbox,
            source,
        };
        let inbox_dir = &plan.recipient.inbox_dir;
        fs::create_dir_all(inbox_dir).await.map_err(io_err)?;

        let target = Self::file_path(inbox_dir, &entry.queue_id);
        let temp = inbox_dir.join(format!(".{}.md.tmp", entry.queue_id));
        let body = Self::render(entry, plan);

        let mut file = fs::File::create(&temp).await.map_err(io_err)?;
        file.write_all(body.as_bytes()).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);

        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(io_err(e));
        }

        tracing::debug!(
            queue_id = %entry.queue_id,
            recipient = %plan.recipient.name,
            path = %target.display(),
            "Inbox file written"
        );
        Ok(TransportReceipt {
            transport: TransportKind::Inbox,
            location: Some(target),
        })
    }
}
