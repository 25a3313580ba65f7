use serde::Serialize;

use super::is_unique_violation;
use super::Store;
use super::StoreError;
use crate::domain::TemplateTitle;

/// A reusable email body. Unrelated to campaigns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "PascalCase")]
pub struct Template {
    pub id: i64,
    pub title: String,
    pub content: String,
}

impl Store {
    #[tracing::instrument(name = "Saving template", skip(self, content), fields(title = %title.as_ref()))]
    pub async fn save_template(
        &self,
        title: &TemplateTitle,
        content: &str,
    ) -> Result<i64, StoreError> {
        let id = sqlx::query("INSERT INTO email_templates (title, content) VALUES (?, ?)")
            .bind(title.as_ref())
            .bind(content)
            .execute(&self.writer)
            .await
            .map_err(|e| match is_unique_violation(&e) {
                true => StoreError::DuplicateTitle(title.as_ref().to_string()),
                false => e.into(),
            })?
            .last_insert_rowid();
        Ok(id)
    }

    /// No rows is not an error; the result is simply empty.
    #[tracing::instrument(name = "Listing templates", skip(self))]
    pub async fn list_templates(&self) -> Result<Vec<Template>, StoreError> {
        let templates = sqlx::query_as::<_, Template>(
            "SELECT id, title, content FROM email_templates ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(templates)
    }

    #[tracing::instrument(name = "Updating template", skip(self, content), fields(title = %title.as_ref()))]
    pub async fn update_template(
        &self,
        id: i64,
        title: &TemplateTitle,
        content: &str,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query("UPDATE email_templates SET title = ?, content = ? WHERE id = ?")
            .bind(title.as_ref())
            .bind(content)
            .bind(id)
            .execute(&self.writer)
            .await
            .map_err(|e| match is_unique_violation(&e) {
                true => StoreError::DuplicateTitle(title.as_ref().to_string()),
                false => e.into(),
            })?
            .rows_affected();
        match updated {
            0 => Err(StoreError::NotFound(format!("Template {id}"))),
            _ => Ok(()),
        }
    }

    /// Deleting a template that doesn't exist is fine.
    #[tracing::instrument(name = "Deleting template", skip(self))]
    pub async fn delete_template(
        &self,
        id: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM email_templates WHERE id = ?")
            .bind(id)
            .execute(&self.writer)
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "Clearing templates", skip(self))]
    pub async fn clear_templates(&self) -> Result<u64, StoreError> {
        let deleted = sqlx::query("DELETE FROM email_templates")
            .execute(&self.writer)
            .await?
            .rows_affected();
        Ok(deleted)
    }
}
