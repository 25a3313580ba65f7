use std::collections::BTreeMap;

use actix_multipart::form::tempfile::TempFile;
use actix_multipart::form::text::Text;
use actix_multipart::form::MultipartForm;
use actix_web::web;
use actix_web::HttpResponse;
use anyhow::Context;
use serde_json::json;
use uuid::Uuid;

use super::ApiError;
use crate::dispatcher::Composition;
use crate::dispatcher::DispatchReport;
use crate::dispatcher::Dispatcher;
use crate::domain::ChunkMeta;
use crate::domain::SubscriberEmail;
use crate::recipients::split_list;
use crate::recipients::RecipientResolver;
use crate::upload::ChunkProgress;
use crate::upload::IncomingFile;
use crate::upload::StagedUpload;
use crate::upload::UploadAssembler;

/// Fields of the compose form. Files are spooled to temp files by the
/// extractor; text fields are optional so that missing ones can be reported by
/// name instead of as a generic extractor error.
#[derive(MultipartForm)]
pub struct ComposeForm {
    /// Comma separated addresses
    recipients: Option<Text<String>>,
    /// Comma separated campaign names
    campaigns: Option<Text<String>>,
    subject: Option<Text<String>>,
    body: Option<Text<String>>,
    #[multipart(rename = "attachments[]")]
    attachments: Vec<TempFile>,
    images: Vec<TempFile>,

    // chunked uploads only
    filename: Option<Text<String>>,
    chunk_index: Option<Text<String>>,
    total_chunks: Option<Text<String>>,
    upload_id: Option<Text<String>>,
    attachment_chunk: Option<TempFile>,
}

fn text(field: Option<Text<String>>) -> Option<String> {
    field
        .map(Text::into_inner)
        .filter(|s| !s.trim().is_empty())
}

fn incoming(file: &TempFile) -> Option<IncomingFile<'_>> {
    match file.file_name.as_deref() {
        Some(name) if !name.trim().is_empty() => Some(IncomingFile {
            file_name: name,
            path: file.file.path(),
        }),
        _ => {
            tracing::warn!("ignoring uploaded file without a name");
            None
        }
    }
}

fn dispatch_response(
    report: DispatchReport,
    upload_id: Option<Uuid>,
) -> HttpResponse {
    let n_sent = report.n_sent();
    let n_total = report.outcomes.len();
    let message = match report.all_sent() {
        true => "Email sent successfully!".to_string(),
        false => format!("Email sent to {n_sent} of {n_total} recipients"),
    };
    HttpResponse::Ok().json(json!({
        "success": report.all_sent(),
        "message": message,
        "upload_id": upload_id,
        "recipients": report.outcomes,
    }))
}

/// Send to everyone, then remove the staged files whatever the outcome.
async fn dispatch_staged(
    dispatcher: &Dispatcher,
    recipients: &[SubscriberEmail],
    mut mail: Composition,
    staged: StagedUpload,
) -> Result<DispatchReport, ApiError> {
    mail.attachments = staged.attachments.clone();
    mail.inline_images = staged.inline_images.clone();
    let result = dispatcher.send(recipients, &mail).await;
    staged.cleanup().await;
    Ok(result?)
}

/// `POST /compose`
///
/// Without `chunk_index`/`total_chunks`, every file in `attachments[]` and
/// `images` is staged and the mail is sent right away.
///
/// With them, the request carries one chunk of a single attachment in
/// `attachment_chunk`. Chunks must be sent in order; the first response
/// contains an `upload_id` that every later chunk has to repeat. Each chunk is
/// acknowledged, and the last one triggers the dispatch. Inline images are not
/// supported for chunked uploads.
///
/// The response lists every recipient as `sent` or `failed`. Partial failure
/// is still a 200; `success` is only true if everyone got the mail.
#[tracing::instrument(
    name = "Composing mail",
    skip_all,
    fields(
        chunk_index = tracing::field::Empty,
        upload_id = tracing::field::Empty,
    )
)]
pub async fn compose(
    MultipartForm(form): MultipartForm<ComposeForm>,
    resolver: web::Data<RecipientResolver>,
    uploads: web::Data<UploadAssembler>,
    dispatcher: web::Data<Dispatcher>,
) -> Result<HttpResponse, ApiError> {
    let explicit = split_list(&text(form.recipients).unwrap_or_default());
    let campaigns = split_list(&text(form.campaigns).unwrap_or_default());
    let recipients = resolver.resolve(&explicit, &campaigns).await?;
    if recipients.is_empty() {
        return Err(ApiError::Validation(
            "recipients: no recipients or campaigns given".to_string(),
        ));
    }

    let mail = Composition {
        subject: text(form.subject).unwrap_or_default(),
        html_body: text(form.body).unwrap_or_default(),
        attachments: vec![],
        inline_images: BTreeMap::new(),
    };

    let chunk = match (text(form.chunk_index), text(form.total_chunks)) {
        (None, None) => None,
        (Some(index), Some(total)) => Some(ChunkMeta::parse(&index, &total).map_err(ApiError::Validation)?),
        (Some(_), None) => {
            return Err(ApiError::Validation(
                "total_chunks: required together with chunk_index".to_string(),
            ))
        }
        (None, Some(_)) => {
            return Err(ApiError::Validation(
                "chunk_index: required together with total_chunks".to_string(),
            ))
        }
    };

    let Some(chunk) = chunk else {
        let attachments: Vec<IncomingFile> = form.attachments.iter().filter_map(incoming).collect();
        let images: Vec<IncomingFile> = form.images.iter().filter_map(incoming).collect();
        let staged = uploads.stage_files(&attachments, &images).await?;
        let report = dispatch_staged(&dispatcher, &recipients, mail, staged).await?;
        return Ok(dispatch_response(report, None));
    };

    tracing::Span::current().record("chunk_index", chunk.index);

    let file_name = text(form.filename).ok_or_else(|| {
        ApiError::Validation("filename: required for chunked uploads".to_string())
    })?;
    let upload_id = text(form.upload_id)
        .map(|id| Uuid::parse_str(id.trim()))
        .transpose()
        .map_err(|e| ApiError::Validation(format!("upload_id: {e}")))?;
    let bytes = match &form.attachment_chunk {
        Some(part) => tokio::fs::read(part.file.path())
            .await
            .context("could not read uploaded chunk")?,
        None => {
            return Err(ApiError::Validation(
                "attachment_chunk: missing chunk data".to_string(),
            ))
        }
    };

    match uploads
        .begin_or_continue(upload_id, &file_name, chunk, &bytes)
        .await?
    {
        ChunkProgress::Partial { upload_id, .. } => {
            tracing::Span::current().record("upload_id", tracing::field::display(upload_id));
            Ok(HttpResponse::Ok().json(json!({
                "success": true,
                "message": "chunk uploaded successfully",
                "upload_id": upload_id,
                "chunk_index": chunk.index,
            })))
        }
        ChunkProgress::Complete { upload_id, staged } => {
            tracing::Span::current().record("upload_id", tracing::field::display(upload_id));
            let report = dispatch_staged(&dispatcher, &recipients, mail, staged).await?;
            Ok(dispatch_response(report, Some(upload_id)))
        }
    }
}
