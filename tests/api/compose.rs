use reqwest::multipart::Form;
use reqwest::multipart::Part;
use serde_json::json;
use serde_json::Value;

use crate::helpers::spawn_app;
use crate::helpers::spawn_app_without_smtp;
use crate::helpers::TestApp;

fn file(
    name: &'static str,
    bytes: &[u8],
) -> Part {
    Part::bytes(bytes.to_vec()).file_name(name)
}

fn mail(
    recipients: &str,
    body: &str,
) -> Form {
    Form::new()
        .text("recipients", recipients.to_string())
        .text("subject", "Hello")
        .text("body", body.to_string())
}

fn chunk(
    recipients: &str,
    index: u32,
    total: u32,
    upload_id: Option<&str>,
    bytes: &[u8],
) -> Form {
    let form = mail(recipients, "<p>see attached</p>")
        .text("filename", "f.bin")
        .text("chunk_index", index.to_string())
        .text("total_chunks", total.to_string())
        .part("attachment_chunk", file("blob", bytes));
    match upload_id {
        Some(id) => form.text("upload_id", id.to_string()),
        None => form,
    }
}

/// Statuses by recipient, in response order
fn outcomes(body: &Value) -> Vec<(String, String)> {
    body["recipients"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| {
            (
                o["recipient"].as_str().unwrap().to_string(),
                o["status"].as_str().unwrap().to_string(),
            )
        })
        .collect()
}

async fn create_campaign(
    app: &TestApp,
    name: &str,
    recipients: &[&str],
) {
    let resp = app
        .post_campaign(&json!({ "name": name, "recipients": recipients }))
        .await;
    assert_eq!(resp.status().as_u16(), 200);
}

#[tokio::test]
async fn compose_sends_one_message_per_recipient() {
    let app = spawn_app().await;
    create_campaign(&app, "weekly", &["a@x.com", "b@x.com"]).await;

    let form = mail("c@x.com, A@x.com", "<p>hi</p>").text("campaigns", "weekly");
    let resp = app.post_compose(form).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();

    assert_eq!(body["success"], true);
    assert_eq!(
        outcomes(&body),
        vec![
            ("c@x.com".to_string(), "sent".to_string()),
            ("A@x.com".to_string(), "sent".to_string()),
            ("b@x.com".to_string(), "sent".to_string()),
        ]
    );

    let mut delivered = app.transport.recipients();
    delivered.sort();
    assert_eq!(delivered, vec!["A@x.com", "b@x.com", "c@x.com"]);
}

#[tokio::test]
async fn compose_with_attachments_and_inline_images() {
    let app = spawn_app().await;

    let form = mail("a@x.com", r#"<p>see</p><img src="logo.png">"#)
        .part("attachments[]", file("report.txt", b"numbers"))
        // same name again: only the first is attached
        .part("attachments[]", file("report.txt", b"other numbers"))
        .part("attachments[]", file("notes.txt", b"notes"))
        .part("images", file("logo.png", b"\x89PNG"));
    let resp = app.post_compose(form).await;
    assert_eq!(resp.status().as_u16(), 200);

    let sent = app.transport.formatted();
    assert_eq!(sent.len(), 1);
    let message = &sent[0];
    assert!(message.contains("report.txt"), "{message}");
    assert!(message.contains("notes.txt"), "{message}");
    assert_eq!(message.matches("filename=\"report.txt\"").count(), 1, "{message}");
    assert!(message.contains("Content-ID: <logo.png>"), "{message}");
    assert!(message.contains(r#"src="cid:logo.png""#), "{message}");

    // staged files are gone once the mail is out
    assert_eq!(app.n_staged(), 0);
}

#[tokio::test]
async fn chunked_upload_dispatches_after_the_last_chunk() {
    let app = spawn_app().await;

    let resp = app.post_compose(chunk("a@x.com", 0, 3, None, b"AB")).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "chunk uploaded successfully");
    let upload_id = body["upload_id"].as_str().unwrap().to_string();
    assert_eq!(app.transport.n_sent(), 0);

    let resp = app
        .post_compose(chunk("a@x.com", 1, 3, Some(&upload_id), b"CD"))
        .await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["chunk_index"], 1);
    assert_eq!(app.transport.n_sent(), 0);

    let staged = app.staging_dir.join(&upload_id).join("f.bin");
    assert_eq!(std::fs::read(&staged).unwrap(), b"ABCD");

    let resp = app
        .post_compose(chunk("a@x.com", 2, 3, Some(&upload_id), b"EF"))
        .await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["upload_id"], upload_id.as_str());

    let sent = app.transport.formatted();
    assert_eq!(sent.len(), 1);
    let message = &sent[0];
    assert!(message.contains("f.bin"), "{message}");
    // "ABCDEF", whichever transfer encoding was picked
    assert!(
        message.contains("ABCDEF") || message.contains("QUJDREVG"),
        "{message}"
    );
    assert_eq!(app.n_staged(), 0);
}

#[tokio::test]
async fn out_of_order_chunk_is_rejected() {
    let app = spawn_app().await;

    let body: Value = app
        .post_compose(chunk("a@x.com", 0, 3, None, b"AB"))
        .await
        .json()
        .await
        .unwrap();
    let upload_id = body["upload_id"].as_str().unwrap().to_string();

    let resp = app
        .post_compose(chunk("a@x.com", 2, 3, Some(&upload_id), b"EF"))
        .await;
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["message"]
        .as_str()
        .unwrap()
        .starts_with("chunk_index"));
    assert_eq!(app.transport.n_sent(), 0);
}

#[tokio::test]
async fn later_chunks_need_the_upload_id() {
    let app = spawn_app().await;

    app.post_compose(chunk("a@x.com", 0, 2, None, b"AB")).await;
    let resp = app.post_compose(chunk("a@x.com", 1, 2, None, b"CD")).await;
    assert_eq!(resp.status().as_u16(), 400);

    let resp = app
        .post_compose(chunk("a@x.com", 1, 2, Some("not-a-uuid"), b"CD"))
        .await;
    assert_eq!(resp.status().as_u16(), 400);
    assert_eq!(app.transport.n_sent(), 0);
}

#[tokio::test]
async fn malformed_chunk_metadata_is_rejected() {
    let app = spawn_app().await;

    for (form, field) in [
        (
            mail("a@x.com", "<p>hi</p>")
                .text("filename", "f.bin")
                .text("chunk_index", "one")
                .text("total_chunks", "3")
                .part("attachment_chunk", file("blob", b"AB")),
            "chunk_index",
        ),
        (
            mail("a@x.com", "<p>hi</p>")
                .text("filename", "f.bin")
                .text("chunk_index", "0")
                .part("attachment_chunk", file("blob", b"AB")),
            "total_chunks",
        ),
        (
            mail("a@x.com", "<p>hi</p>")
                .text("chunk_index", "0")
                .text("total_chunks", "1")
                .part("attachment_chunk", file("blob", b"AB")),
            "filename",
        ),
        (
            mail("a@x.com", "<p>hi</p>")
                .text("filename", "f.bin")
                .text("chunk_index", "0")
                .text("total_chunks", "1"),
            "attachment_chunk",
        ),
    ] {
        let resp = app.post_compose(form).await;
        assert_eq!(resp.status().as_u16(), 400, "{field}");
        let body: Value = resp.json().await.unwrap();
        assert!(
            body["message"].as_str().unwrap().starts_with(field),
            "{field}: {body}"
        );
    }
    assert_eq!(app.transport.n_sent(), 0);
}

#[tokio::test]
async fn one_failing_recipient_does_not_stop_the_others() {
    let app = spawn_app().await;
    app.transport.fail_for("bad@x.com");

    let resp = app
        .post_compose(mail("good@x.com, bad@x.com, other@x.com", "<p>hi</p>"))
        .await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();

    assert_eq!(body["success"], false);
    assert_eq!(
        outcomes(&body),
        vec![
            ("good@x.com".to_string(), "sent".to_string()),
            ("bad@x.com".to_string(), "failed".to_string()),
            ("other@x.com".to_string(), "sent".to_string()),
        ]
    );
    assert!(body["recipients"][1]["reason"]
        .as_str()
        .unwrap()
        .contains("mailbox unavailable"));
    assert_eq!(app.transport.n_sent(), 3);
}

#[tokio::test]
async fn recipients_are_validated_before_sending() {
    let app = spawn_app().await;

    let resp = app.post_compose(mail("a@x.com, not-an-email", "<p>hi</p>")).await;
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["message"]
        .as_str()
        .unwrap()
        .starts_with("recipients"));

    let resp = app.post_compose(mail(" , ", "<p>hi</p>")).await;
    assert_eq!(resp.status().as_u16(), 400);

    let resp = app
        .post_compose(mail("", "<p>hi</p>").text("campaigns", "nope"))
        .await;
    assert_eq!(resp.status().as_u16(), 404);

    assert_eq!(app.transport.n_sent(), 0);
}

#[tokio::test]
async fn empty_campaign_alone_is_no_recipients() {
    let app = spawn_app().await;
    create_campaign(&app, "weekly", &[]).await;

    let resp = app
        .post_compose(mail("", "<p>hi</p>").text("campaigns", "weekly"))
        .await;
    assert_eq!(resp.status().as_u16(), 400);
    assert_eq!(app.transport.n_sent(), 0);
}

#[tokio::test]
async fn compose_without_smtp_settings_fails_without_sending() {
    let app = spawn_app_without_smtp().await;

    let resp = app
        .post_compose(
            mail("a@x.com", "<p>hi</p>").part("attachments[]", file("report.txt", b"numbers")),
        )
        .await;
    assert_eq!(resp.status().as_u16(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    // staged files are removed on failure too
    assert_eq!(app.n_staged(), 0);
}
