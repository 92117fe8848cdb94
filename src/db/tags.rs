//! Tag repository: tag creation, job association, and scope-aware listing.

use sea_orm::sea_query::Query;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, EntityTrait, NotSet, QueryFilter, QueryOrder, Set,
};

use crate::entity::{job_tag, tag};
use crate::error::{AppError, AppResult};
use crate::models::AuthenticatedUser;

use super::DbPool;

impl DbPool {
    /// Find a tag by its identity (type, name, scope).
    pub async fn find_tag(
        &self,
        tag_type: &str,
        tag_name: &str,
        tag_scope: &str,
    ) -> AppResult<Option<tag::Model>> {
        tag::Entity::find()
            .filter(tag::Column::TagType.eq(tag_type))
            .filter(tag::Column::TagName.eq(tag_name))
            .filter(tag::Column::TagScope.eq(tag_scope))
            .one(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to find tag: {}", e)))
    }

    /// Create a tag without attaching it to a job; returns the existing row
    /// when the identity is already present.
    pub async fn create_tag(
        &self,
        tag_type: &str,
        tag_name: &str,
        tag_scope: Option<&str>,
    ) -> AppResult<tag::Model> {
        let scope = tag_scope.unwrap_or("global");
        if let Some(existing) = self.find_tag(tag_type, tag_name, scope).await? {
            return Ok(existing);
        }

        let model = tag::ActiveModel {
            id: NotSet,
            tag_type: Set(tag_type.to_string()),
            tag_name: Set(tag_name.to_string()),
            tag_scope: Set(scope.to_string()),
        };
        model
            .insert(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to create tag: {}", e)))
    }

    /// Create the tag if missing and associate it with the job; idempotent on
    /// (job, tag). Scope defaults to "global". Returns the tag id.
    pub async fn add_tag_or_create(
        &self,
        dbid: i64,
        tag_type: &str,
        tag_name: &str,
        tag_scope: Option<&str>,
    ) -> AppResult<i64> {
        let tag = self.create_tag(tag_type, tag_name, tag_scope).await?;
        self.add_tag(dbid, tag.id).await?;
        Ok(tag.id)
    }

    /// Associate an existing tag with a job; a second call is a no-op.
    pub async fn add_tag(&self, dbid: i64, tag_id: i64) -> AppResult<()> {
        let existing = job_tag::Entity::find_by_id((dbid, tag_id))
            .one(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to check jobtag: {}", e)))?;
        if existing.is_some() {
            return Ok(());
        }

        let model = job_tag::ActiveModel {
            job_id: Set(dbid),
            tag_id: Set(tag_id),
        };
        match model.insert(self.connection()).await {
            Ok(_) => Ok(()),
            // A concurrent insert of the same pair is still success.
            Err(e) if e.to_string().contains("duplicate key") => Ok(()),
            Err(e) => Err(AppError::Database(format!("Failed to tag job: {}", e))),
        }
    }

    /// Detach a tag from a job.
    pub async fn remove_tag_from_job(&self, dbid: i64, tag_id: i64) -> AppResult<()> {
        job_tag::Entity::delete_by_id((dbid, tag_id))
            .exec(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to remove tag: {}", e)))?;
        Ok(())
    }

    /// All tags attached to one job, restricted to scopes the principal may see.
    pub async fn job_tags(
        &self,
        dbid: i64,
        principal: &AuthenticatedUser,
    ) -> AppResult<Vec<tag::Model>> {
        let sub = Query::select()
            .column(job_tag::Column::TagId)
            .from(job_tag::Entity)
            .and_where(job_tag::Column::JobId.eq(dbid))
            .to_owned();

        tag::Entity::find()
            .filter(tag::Column::Id.in_subquery(sub))
            .filter(scope_condition(principal))
            .order_by_asc(tag::Column::Id)
            .all(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to load job tags: {}", e)))
    }

    /// All tags visible to the principal.
    pub async fn list_tags(&self, principal: &AuthenticatedUser) -> AppResult<Vec<tag::Model>> {
        tag::Entity::find()
            .filter(scope_condition(principal))
            .order_by_asc(tag::Column::Id)
            .all(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to list tags: {}", e)))
    }
}

/// Tags are visible when their scope is "global", the principal's own
/// username, or "admin" for admins (who see everything).
fn scope_condition(principal: &AuthenticatedUser) -> Condition {
    if principal.is_admin() {
        return Condition::all();
    }
    Condition::any()
        .add(tag::Column::TagScope.eq("global"))
        .add(tag::Column::TagScope.eq(principal.username.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use sea_orm::{DatabaseBackend, QueryTrait};

    #[test]
    fn test_scope_condition_regular_user() {
        let user = AuthenticatedUser::new("alice", [Role::User]);
        let sql = tag::Entity::find()
            .filter(scope_condition(&user))
            .build(DatabaseBackend::Postgres)
            .to_string();
        assert!(sql.contains("\"tag_scope\" = 'global'"));
        assert!(sql.contains("\"tag_scope\" = 'alice'"));
        assert!(!sql.contains("admin"));
    }

    #[test]
    fn test_scope_condition_admin_sees_all() {
        let admin = AuthenticatedUser::new("root", [Role::Admin]);
        let sql = tag::Entity::find()
            .filter(scope_condition(&admin))
            .build(DatabaseBackend::Postgres)
            .to_string();
        assert!(!sql.contains("tag_scope"));
    }
}
