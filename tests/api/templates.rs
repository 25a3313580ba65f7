use serde_json::json;
use serde_json::Value;

use crate::helpers::spawn_app;

#[tokio::test]
async fn no_templates_is_an_empty_list() {
    let app = spawn_app().await;

    let resp = app.get_templates().await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["templates"], json!([]));
}

#[tokio::test]
async fn saved_template_is_listed() {
    let app = spawn_app().await;

    let resp = app
        .post_template(&json!({ "Title": "Welcome", "Content": "<p>hi</p>" }))
        .await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    let id = body["id"].as_i64().unwrap();

    // lowercase keys work too
    let resp = app
        .post_template(&json!({ "title": "Goodbye", "content": "<p>bye</p>" }))
        .await;
    assert_eq!(resp.status().as_u16(), 200);

    let body: Value = app.get_templates().await.json().await.unwrap();
    let templates = body["templates"].as_array().unwrap();
    assert_eq!(templates.len(), 2);
    assert_eq!(templates[0]["Id"], id);
    assert_eq!(templates[0]["Title"], "Welcome");
    assert_eq!(templates[0]["Content"], "<p>hi</p>");
    assert_eq!(templates[1]["Title"], "Goodbye");
}

#[tokio::test]
async fn duplicate_title_is_a_conflict() {
    let app = spawn_app().await;
    let template = json!({ "Title": "Welcome", "Content": "<p>hi</p>" });

    assert_eq!(app.post_template(&template).await.status().as_u16(), 200);
    let resp = app.post_template(&template).await;
    assert_eq!(resp.status().as_u16(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(body["message"].as_str().unwrap().contains("Welcome"));

    assert_eq!(app.count_rows("email_templates").await, 1);
}

#[tokio::test]
async fn invalid_template_is_rejected() {
    let app = spawn_app().await;

    for (body, msg) in [
        (json!({ "Title": "  ", "Content": "x" }), "blank title"),
        (json!({ "Content": "x" }), "missing title"),
        (json!({ "Title": "x" }), "missing content"),
    ] {
        let resp = app.post_template(&body).await;
        assert_eq!(resp.status().as_u16(), 400, "{msg}");
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["success"], false, "{msg}");
    }
    assert_eq!(app.count_rows("email_templates").await, 0);
}

#[tokio::test]
async fn update_template() {
    let app = spawn_app().await;
    let body: Value = app
        .post_template(&json!({ "Title": "Welcome", "Content": "old" }))
        .await
        .json()
        .await
        .unwrap();
    let id = body["id"].as_i64().unwrap();
    app.post_template(&json!({ "Title": "Other", "Content": "x" }))
        .await;

    let put = |id: i64, body: Value| {
        let client = app.api_client.clone();
        let url = format!("{}/templates/{id}", app.addr);
        async move { client.put(url).json(&body).send().await.unwrap() }
    };

    let resp = put(id, json!({ "Title": "Welcome!", "Content": "new" })).await;
    assert_eq!(resp.status().as_u16(), 200);

    let resp = put(id + 100, json!({ "Title": "Ghost", "Content": "x" })).await;
    assert_eq!(resp.status().as_u16(), 404);

    let resp = put(id, json!({ "Title": "Other", "Content": "x" })).await;
    assert_eq!(resp.status().as_u16(), 409);

    let body: Value = app.get_templates().await.json().await.unwrap();
    assert_eq!(body["templates"][0]["Title"], "Welcome!");
    assert_eq!(body["templates"][0]["Content"], "new");
}

#[tokio::test]
async fn delete_and_clear_templates() {
    let app = spawn_app().await;
    let body: Value = app
        .post_template(&json!({ "Title": "a", "Content": "x" }))
        .await
        .json()
        .await
        .unwrap();
    let id = body["id"].as_i64().unwrap();
    app.post_template(&json!({ "Title": "b", "Content": "x" }))
        .await;
    app.post_template(&json!({ "Title": "c", "Content": "x" }))
        .await;

    // deleting twice is fine
    for _ in 0..2 {
        let resp = app
            .api_client
            .delete(format!("{}/templates/{id}", app.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
    }
    assert_eq!(app.count_rows("email_templates").await, 2);

    let resp = app
        .api_client
        .delete(format!("{}/templates", app.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(app.count_rows("email_templates").await, 0);
}
