use sqlx::Sqlite;
use sqlx::SqliteConnection;
use sqlx::Transaction;

use super::is_unique_violation;
use super::Store;
use super::StoreError;
use crate::domain::CampaignName;
use crate::domain::SubscriberEmail;

type SqliteTransaction = Transaction<'static, Sqlite>;

// Subscriber creation policy: subscribers are created on demand, everywhere.
// Adding an unknown address to a list, or creating a campaign with unknown
// addresses, inserts the subscriber in the same transaction as the membership.

async fn find_list_id(
    conn: &mut SqliteConnection,
    name: &CampaignName,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar("SELECT id FROM mailing_lists WHERE name = ?")
        .bind(name.as_ref())
        .fetch_optional(conn)
        .await
}

async fn find_subscriber_id(
    conn: &mut SqliteConnection,
    email: &SubscriberEmail,
) -> Result<Option<i64>, sqlx::Error> {
    // `email` is declared COLLATE NOCASE, so this lookup ignores case
    sqlx::query_scalar("SELECT id FROM subscribers WHERE email = ?")
        .bind(email.as_ref())
        .fetch_optional(conn)
        .await
}

async fn find_or_create_subscriber(
    conn: &mut SqliteConnection,
    email: &SubscriberEmail,
) -> Result<i64, sqlx::Error> {
    if let Some(id) = find_subscriber_id(&mut *conn, email).await? {
        return Ok(id);
    }
    let id = sqlx::query("INSERT INTO subscribers (email) VALUES (?)")
        .bind(email.as_ref())
        .execute(conn)
        .await?
        .last_insert_rowid();
    Ok(id)
}

/// Both ids must already exist; callers look them up in the same transaction.
/// Returns false if the pair was already a member.
async fn insert_membership(
    conn: &mut SqliteConnection,
    campaign_id: i64,
    subscriber_id: i64,
) -> Result<bool, sqlx::Error> {
    let inserted = sqlx::query(
        "
        INSERT INTO memberships (campaign_id, subscriber_id)
        VALUES (?, ?)
        ON CONFLICT (campaign_id, subscriber_id) DO NOTHING
        ",
    )
    .bind(campaign_id)
    .bind(subscriber_id)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(inserted > 0)
}

fn list_not_found(name: &CampaignName) -> StoreError {
    StoreError::NotFound(format!("Mailing list {:?}", name.as_ref()))
}

impl Store {
    /// Transactions that write. They queue for the single writer connection.
    async fn begin(&self) -> Result<SqliteTransaction, StoreError> { Ok(self.writer.begin().await?) }

    #[tracing::instrument(name = "Creating mailing list", skip(self), fields(list = %name))]
    pub async fn create_mailing_list(
        &self,
        name: &CampaignName,
    ) -> Result<i64, StoreError> {
        let id = sqlx::query("INSERT INTO mailing_lists (name) VALUES (?)")
            .bind(name.as_ref())
            .execute(&self.writer)
            .await
            .map_err(|e| match is_unique_violation(&e) {
                true => StoreError::DuplicateName(name.to_string()),
                false => e.into(),
            })?
            .last_insert_rowid();
        Ok(id)
    }

    /// Remove the list together with all of its memberships. Subscribers stay,
    /// they may belong to other lists. Deleting a list that doesn't exist is
    /// fine.
    #[tracing::instrument(name = "Deleting mailing list", skip(self), fields(list = %name))]
    pub async fn delete_mailing_list(
        &self,
        name: &CampaignName,
    ) -> Result<(), StoreError> {
        let mut transaction = self.begin().await?;

        let Some(list_id) = find_list_id(&mut transaction, name).await? else {
            return Ok(());
        };

        sqlx::query("DELETE FROM memberships WHERE campaign_id = ?")
            .bind(list_id)
            .execute(&mut *transaction)
            .await?;
        sqlx::query("DELETE FROM mailing_lists WHERE id = ?")
            .bind(list_id)
            .execute(&mut *transaction)
            .await?;

        transaction.commit().await?; // this is the last action!
        Ok(())
    }

    /// Subscribe `email` to an existing list, creating the subscriber if this is
    /// the first time we see the address.
    #[tracing::instrument(name = "Adding subscriber", skip(self), fields(list = %list, email = %email))]
    pub async fn add_subscriber(
        &self,
        list: &CampaignName,
        email: &SubscriberEmail,
    ) -> Result<(), StoreError> {
        let mut transaction = self.begin().await?;

        let list_id = find_list_id(&mut transaction, list)
            .await?
            .ok_or_else(|| list_not_found(list))?;
        let subscriber_id = find_or_create_subscriber(&mut transaction, email).await?;

        if !insert_membership(&mut transaction, list_id, subscriber_id).await? {
            // dropping the transaction rolls it back; nothing was written anyway
            return Err(StoreError::AlreadyMember {
                list: list.to_string(),
                email: email.to_string(),
            });
        }

        transaction.commit().await?;
        Ok(())
    }

    /// Removing an address that isn't subscribed (or doesn't exist at all) is
    /// not an error. The list itself must exist.
    #[tracing::instrument(name = "Removing subscriber", skip(self), fields(list = %list, email = %email))]
    pub async fn remove_subscriber(
        &self,
        list: &CampaignName,
        email: &SubscriberEmail,
    ) -> Result<(), StoreError> {
        let mut transaction = self.begin().await?;

        let list_id = find_list_id(&mut transaction, list)
            .await?
            .ok_or_else(|| list_not_found(list))?;

        if let Some(subscriber_id) = find_subscriber_id(&mut transaction, email).await? {
            sqlx::query("DELETE FROM memberships WHERE campaign_id = ? AND subscriber_id = ?")
                .bind(list_id)
                .bind(subscriber_id)
                .execute(&mut *transaction)
                .await?;
        }

        transaction.commit().await?;
        Ok(())
    }

    /// Emails of every member of `list`, read from a single snapshot.
    #[tracing::instrument(name = "Resolving list members", skip(self), fields(list = %list))]
    pub async fn resolve_list_members(
        &self,
        list: &CampaignName,
    ) -> Result<Vec<String>, StoreError> {
        let mut transaction = self.pool.begin().await?;

        let list_id = find_list_id(&mut transaction, list)
            .await?
            .ok_or_else(|| list_not_found(list))?;

        let members = sqlx::query_scalar(
            "
            SELECT s.email
            FROM memberships m
            JOIN subscribers s ON s.id = m.subscriber_id
            WHERE m.campaign_id = ?
            ORDER BY m.id
            ",
        )
        .bind(list_id)
        .fetch_all(&mut *transaction)
        .await?;

        transaction.commit().await?;
        Ok(members)
    }

    /// All-or-nothing: the campaign, any new subscribers and all memberships
    /// are written in one transaction. If any insert fails, none of them
    /// persist. Repeated addresses in `emails` are subscribed once.
    #[tracing::instrument(
        name = "Creating campaign with subscribers",
        skip(self, emails),
        fields(campaign = %name, n_subscribers = emails.len())
    )]
    pub async fn create_campaign_with_subscribers(
        &self,
        name: &CampaignName,
        emails: &[SubscriberEmail],
    ) -> Result<i64, StoreError> {
        let mut transaction = self.begin().await?;

        let campaign_id = sqlx::query("INSERT INTO mailing_lists (name) VALUES (?)")
            .bind(name.as_ref())
            .execute(&mut *transaction)
            .await
            .map_err(|e| match is_unique_violation(&e) {
                true => StoreError::DuplicateName(name.to_string()),
                false => e.into(),
            })?
            .last_insert_rowid();

        for email in emails {
            let subscriber_id = find_or_create_subscriber(&mut transaction, email)
                .await
                .map_err(|e| {
                    tracing::error!("could not add {email} to campaign: {e:?}");
                    e
                })?;
            insert_membership(&mut transaction, campaign_id, subscriber_id).await?;
        }

        transaction.commit().await?;
        Ok(campaign_id)
    }

    /// Never `None`; no campaigns is an empty list.
    #[tracing::instrument(name = "Listing campaign names", skip(self))]
    pub async fn list_campaign_names(&self) -> Result<Vec<String>, StoreError> {
        let names = sqlx::query_scalar("SELECT name FROM mailing_lists ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }
}
