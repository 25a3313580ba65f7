use actix_web::web;
use actix_web::HttpResponse;
use serde::Deserialize;
use serde_json::json;

use super::ApiError;
use crate::domain::CampaignName;
use crate::domain::SubscriberEmail;
use crate::store::Store;

fn parse_name(name: String) -> Result<CampaignName, ApiError> {
    CampaignName::parse(name).map_err(|e| ApiError::Validation(format!("name: {e}")))
}

fn parse_email(
    field: &str,
    email: String,
) -> Result<SubscriberEmail, ApiError> {
    SubscriberEmail::parse(email).map_err(|e| ApiError::Validation(format!("{field}: {e}")))
}

#[derive(Deserialize)]
pub struct NewCampaign {
    #[serde(alias = "campaignName")]
    name: String,
    #[serde(alias = "mailingList", default)]
    recipients: Vec<String>,
}

#[derive(Deserialize)]
pub struct MembersQuery {
    name: String,
}

#[derive(Deserialize)]
pub struct NewSubscriber {
    email: String,
}

/// `GET /campaigns`
pub async fn list_campaigns(store: web::Data<Store>) -> Result<HttpResponse, ApiError> {
    let campaigns = store.list_campaign_names().await?;
    Ok(HttpResponse::Ok().json(json!({ "campaigns": campaigns })))
}

/// `POST /campaigns`
///
/// Creates the list and subscribes every address in one go; if anything fails,
/// nothing is created.
///
/// ```sh
///     curl -H 'Content-Type: application/json' \
///         -d '{"campaignName": "weekly", "mailingList": ["a@foo.com", "b@foo.com"]}' \
///         http://127.0.0.1:8000/campaigns
/// ```
#[tracing::instrument(
    name = "Creating campaign",
    skip(body, store),
    fields(campaign = %body.name, n_recipients = body.recipients.len())
)]
pub async fn create_campaign(
    body: web::Json<NewCampaign>,
    store: web::Data<Store>,
) -> Result<HttpResponse, ApiError> {
    let NewCampaign { name, recipients } = body.into_inner();
    let name = parse_name(name)?;
    let emails = recipients
        .into_iter()
        .filter(|r| !r.trim().is_empty())
        .map(|r| parse_email("recipients", r))
        .collect::<Result<Vec<_>, _>>()?;

    let id = store
        .create_campaign_with_subscribers(&name, &emails)
        .await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Campaign saved successfully!",
        "id": id,
    })))
}

/// `GET /campaigns/members?name=weekly`
///
/// Returns a bare array of addresses.
pub async fn campaign_members(
    query: web::Query<MembersQuery>,
    store: web::Data<Store>,
) -> Result<HttpResponse, ApiError> {
    let name = parse_name(query.into_inner().name)?;
    let members = store.resolve_list_members(&name).await?;
    Ok(HttpResponse::Ok().json(members))
}

/// `DELETE /campaigns/{name}`
#[tracing::instrument(name = "Deleting campaign", skip(store))]
pub async fn delete_campaign(
    path: web::Path<String>,
    store: web::Data<Store>,
) -> Result<HttpResponse, ApiError> {
    let name = parse_name(path.into_inner())?;
    store.delete_mailing_list(&name).await?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "message": "Campaign deleted" })))
}

/// `POST /campaigns/{name}/subscribers`
#[tracing::instrument(name = "Subscribing to campaign", skip(body, store))]
pub async fn subscribe(
    path: web::Path<String>,
    body: web::Json<NewSubscriber>,
    store: web::Data<Store>,
) -> Result<HttpResponse, ApiError> {
    let name = parse_name(path.into_inner())?;
    let email = parse_email("email", body.into_inner().email)?;
    store.add_subscriber(&name, &email).await?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "message": "Subscribed" })))
}

/// `DELETE /campaigns/{name}/subscribers/{email}`
#[tracing::instrument(name = "Unsubscribing from campaign", skip(store))]
pub async fn unsubscribe(
    path: web::Path<(String, String)>,
    store: web::Data<Store>,
) -> Result<HttpResponse, ApiError> {
    let (name, email) = path.into_inner();
    let name = parse_name(name)?;
    let email = parse_email("email", email)?;
    store.remove_subscriber(&name, &email).await?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "message": "Unsubscribed" })))
}
