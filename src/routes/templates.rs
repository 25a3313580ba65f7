use actix_web::web;
use actix_web::HttpResponse;
use serde::Deserialize;
use serde_json::json;

use super::ApiError;
use crate::domain::TemplateTitle;
use crate::store::Store;

/// Accepts both `title`/`content` and the capitalised `Title`/`Content` sent by
/// the compose page.
#[derive(Deserialize)]
pub struct TemplateBody {
    #[serde(alias = "Title")]
    title: String,
    #[serde(alias = "Content")]
    content: String,
}

impl TemplateBody {
    fn parse(self) -> Result<(TemplateTitle, String), ApiError> {
        let title =
            TemplateTitle::parse(self.title).map_err(|e| ApiError::Validation(format!("title: {e}")))?;
        Ok((title, self.content))
    }
}

/// `GET /templates`
pub async fn list_templates(store: web::Data<Store>) -> Result<HttpResponse, ApiError> {
    let templates = store.list_templates().await?;
    Ok(HttpResponse::Ok().json(json!({ "templates": templates })))
}

/// `POST /templates`
///
/// ```sh
///     curl -H 'Content-Type: application/json' \
///         -d '{"Title": "Welcome", "Content": "<p>hi</p>"}' \
///         http://127.0.0.1:8000/templates
/// ```
#[tracing::instrument(name = "Saving new template", skip(body, store))]
pub async fn save_template(
    body: web::Json<TemplateBody>,
    store: web::Data<Store>,
) -> Result<HttpResponse, ApiError> {
    let (title, content) = body.into_inner().parse()?;
    let id = store.save_template(&title, &content).await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Template saved successfully!",
        "id": id,
    })))
}

/// `PUT /templates/{id}`
#[tracing::instrument(name = "Updating template", skip(body, store))]
pub async fn update_template(
    path: web::Path<i64>,
    body: web::Json<TemplateBody>,
    store: web::Data<Store>,
) -> Result<HttpResponse, ApiError> {
    let (title, content) = body.into_inner().parse()?;
    store
        .update_template(path.into_inner(), &title, &content)
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "message": "Template updated" })))
}

/// `DELETE /templates/{id}`
pub async fn delete_template(
    path: web::Path<i64>,
    store: web::Data<Store>,
) -> Result<HttpResponse, ApiError> {
    store.delete_template(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "message": "Template deleted" })))
}

/// `DELETE /templates`
pub async fn clear_templates(store: web::Data<Store>) -> Result<HttpResponse, ApiError> {
    let n = store.clear_templates().await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": format!("Deleted {n} templates"),
    })))
}
