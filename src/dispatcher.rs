//! Builds one MIME message per recipient and hands each to the
//! `MailTransport`, collecting a per-recipient outcome.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use lettre::message::header::ContentType;
use lettre::message::Attachment;
use lettre::message::Mailbox;
use lettre::message::MultiPart;
use lettre::message::SinglePart;
use lettre::Message;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::domain::SubscriberEmail;
use crate::email_client::MailTransport;
use crate::utils::error_chain_fmt;

/// What to send, independent of who receives it.
#[derive(Debug, Clone, Default)]
pub struct Composition {
    pub subject: String,
    pub html_body: String,
    pub attachments: Vec<PathBuf>,
    /// Content id -> image path. Every occurrence of a content id in
    /// `html_body` is turned into a `cid:` reference to the embedded image.
    pub inline_images: BTreeMap<String, PathBuf>,
}

/// Failures that stop a dispatch before anything is sent
#[derive(thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid attachment {}: {reason}", path.display())]
    InvalidAttachment { path: PathBuf, reason: String },
    #[error("Mail transport is not usable")]
    TransportConfig(#[source] anyhow::Error),
    #[error("Could not read attachment")]
    Io(#[from] std::io::Error),
}

impl Debug for DispatchError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// `Pending -> Sent` or `Pending -> Failed`; both are terminal, nothing is
/// retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipientOutcome {
    pub recipient: String,
    #[serde(flatten)]
    pub status: DeliveryStatus,
}

impl RecipientOutcome {
    fn pending(recipient: &SubscriberEmail) -> Self {
        Self {
            recipient: recipient.to_string(),
            status: DeliveryStatus::Pending,
        }
    }

    fn settle(
        &mut self,
        result: Result<(), anyhow::Error>,
    ) {
        if self.status != DeliveryStatus::Pending {
            return;
        }
        self.status = match result {
            Ok(()) => DeliveryStatus::Sent,
            Err(e) => {
                tracing::warn!(
                    error.cause_chain = ?e,
                    recipient = %self.recipient,
                    "failed to deliver"
                );
                DeliveryStatus::Failed {
                    reason: format!("{e:#}"),
                }
            }
        };
    }
}

/// Outcome of every recipient of one dispatch, in the order they were given
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub outcomes: Vec<RecipientOutcome>,
}

impl DispatchReport {
    pub fn all_sent(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| o.status == DeliveryStatus::Sent)
    }

    pub fn n_sent(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == DeliveryStatus::Sent)
            .count()
    }

    pub fn status_of(
        &self,
        recipient: &str,
    ) -> Option<&DeliveryStatus> {
        self.outcomes
            .iter()
            .find(|o| o.recipient == recipient)
            .map(|o| &o.status)
    }
}

/// Replace every content id in `html` with `cid:<id>`. Ids that are already
/// written as `cid:<id>` are left alone, and when ids overlap the longest
/// match wins.
pub fn embed_content_ids(
    html: &str,
    content_ids: &[&str],
) -> String {
    let mut ids: Vec<&str> = content_ids
        .iter()
        .copied()
        .filter(|id| !id.is_empty())
        .collect();
    ids.sort_by_key(|id| std::cmp::Reverse(id.len()));

    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(c) = rest.chars().next() {
        match ids.iter().find(|id| rest.starts_with(**id)) {
            Some(id) => {
                if !out.ends_with("cid:") {
                    out.push_str("cid:");
                }
                out.push_str(id);
                rest = &rest[id.len()..];
            }
            None => {
                out.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
    }
    out
}

struct LoadedFile {
    name: String,
    bytes: Vec<u8>,
    content_type: ContentType,
}

fn content_type_for(path: &Path) -> Result<ContentType, DispatchError> {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    ContentType::parse(mime.essence_str()).map_err(|e| DispatchError::InvalidAttachment {
        path: path.to_path_buf(),
        reason: format!("unusable content type {mime}: {e}"),
    })
}

/// Every path must be an existing regular file. All of them are checked before
/// any is read, so one bad path fails the whole dispatch without doing any
/// work.
async fn load_files(paths: &[&Path]) -> Result<Vec<LoadedFile>, DispatchError> {
    for path in paths {
        let invalid = |reason: &str| DispatchError::InvalidAttachment {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(invalid("not a regular file")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(invalid("no such file"))
            }
            Err(e) => return Err(e.into()),
        }
    }

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("attachment")
            .to_string();
        files.push(LoadedFile {
            name,
            bytes: tokio::fs::read(path).await?,
            content_type: content_type_for(path)?,
        });
    }
    Ok(files)
}

enum Body {
    Single(SinglePart),
    Multi(MultiPart),
}

/// html only: a single part. Inline images: `multipart/related` holding the
/// html and the images. Attachments: `multipart/mixed` around either of the
/// above.
fn build_body(
    html: String,
    attachments: Vec<LoadedFile>,
    images: Vec<(String, LoadedFile)>,
) -> Body {
    let html = SinglePart::html(html);

    let content = match images.is_empty() {
        true => Body::Single(html),
        false => {
            let mut related = MultiPart::related().singlepart(html);
            for (cid, image) in images {
                related = related
                    .singlepart(Attachment::new_inline(cid).body(image.bytes, image.content_type));
            }
            Body::Multi(related)
        }
    };

    if attachments.is_empty() {
        return content;
    }

    let mut mixed = match content {
        Body::Single(part) => MultiPart::mixed().singlepart(part),
        Body::Multi(part) => MultiPart::mixed().multipart(part),
    };
    for file in attachments {
        mixed = mixed.singlepart(Attachment::new(file.name).body(file.bytes, file.content_type));
    }
    Body::Multi(mixed)
}

/// One message, one `To`
fn build_message(
    from: &Mailbox,
    to: &SubscriberEmail,
    subject: &str,
    body: &Body,
) -> Result<Message, anyhow::Error> {
    let to: Mailbox = to.as_ref().parse()?;
    let builder = Message::builder()
        .from(from.clone())
        .to(to)
        .subject(subject);
    let message = match body {
        Body::Single(part) => builder.singlepart(part.clone())?,
        Body::Multi(part) => builder.multipart(part.clone())?,
    };
    Ok(message)
}

/// Sends a composition to many recipients, one message each, so that a failure
/// for one address never blocks the others.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn MailTransport>,
    concurrency: usize,
}

impl Dispatcher {
    /// `concurrency` bounds how many recipients are being talked to at once (at
    /// least one).
    pub fn new(
        transport: Arc<dyn MailTransport>,
        concurrency: usize,
    ) -> Self {
        Self {
            transport,
            concurrency: concurrency.max(1),
        }
    }

    /// Fails as a whole only if an attachment or image is unusable, or if the
    /// transport is not configured; in both cases nothing is sent. Otherwise
    /// every recipient is attempted exactly once, in no particular order, and
    /// the report says who got it.
    #[tracing::instrument(
        name = "Dispatching mail",
        skip_all,
        fields(
            subject = %mail.subject,
            n_recipients = recipients.len(),
            n_attachments = mail.attachments.len(),
            n_images = mail.inline_images.len(),
        )
    )]
    pub async fn send(
        &self,
        recipients: &[SubscriberEmail],
        mail: &Composition,
    ) -> Result<DispatchReport, DispatchError> {
        let attachment_paths: Vec<&Path> = mail.attachments.iter().map(PathBuf::as_path).collect();
        let image_paths: Vec<&Path> = mail.inline_images.values().map(PathBuf::as_path).collect();
        let attachments = load_files(&attachment_paths).await?;
        let images = load_files(&image_paths).await?;

        let from = self
            .transport
            .sender()
            .map_err(DispatchError::TransportConfig)?;

        let content_ids: Vec<&str> = mail.inline_images.keys().map(String::as_str).collect();
        let html = embed_content_ids(&mail.html_body, &content_ids);
        let images = mail.inline_images.keys().cloned().zip(images).collect();
        let body = build_body(html, attachments, images);

        let mut outcomes: Vec<RecipientOutcome> =
            recipients.iter().map(RecipientOutcome::pending).collect();

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for (i, recipient) in recipients.iter().enumerate() {
            let message = match build_message(&from, recipient, &mail.subject, &body) {
                Ok(message) => message,
                Err(e) => {
                    outcomes[i].settle(Err(e));
                    continue;
                }
            };
            let transport = self.transport.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => transport.send(message).await,
                    Err(e) => Err(e.into()),
                };
                (i, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((i, result)) => outcomes[i].settle(result),
                Err(e) => tracing::error!(error.cause_chain = ?e, "delivery task died"),
            }
        }

        // only a task that died can leave a recipient pending
        for outcome in outcomes.iter_mut() {
            outcome.settle(Err(anyhow::anyhow!("delivery was interrupted")));
        }

        let report = DispatchReport { outcomes };
        tracing::info!(
            n_sent = report.n_sent(),
            n_failed = report.outcomes.len() - report.n_sent(),
            "dispatch finished"
        );
        Ok(report)
    }
}
