//! GraphQL mutation resolvers.

use async_graphql::{Context, Object, Result};

use crate::db::DbPool;
use crate::models::AuthenticatedUser;

use super::types::{GqlTag, to_gql};

pub struct MutationRoot;

#[Object]
impl MutationRoot {
    /// Create a tag; scope defaults to "global" and must be available to the
    /// caller.
    async fn create_tag(
        &self,
        ctx: &Context<'_>,
        #[graphql(name = "type")] tag_type: String,
        name: String,
        scope: Option<String>,
    ) -> Result<GqlTag> {
        let pool = ctx.data::<DbPool>()?;
        let principal = ctx.data::<AuthenticatedUser>()?;

        let scope = scope.unwrap_or_else(|| "global".to_string());
        if !principal.may_use_tag_scope(&scope) {
            return Err(async_graphql::Error::new(format!(
                "tag scope '{}' is not available to you",
                scope
            )));
        }

        let tag = pool
            .create_tag(&tag_type, &name, Some(&scope))
            .await
            .map_err(to_gql)?;
        Ok(tag.into())
    }

    /// Attach existing tags to a job; returns the job's visible tags.
    async fn add_tags_to_job(
        &self,
        ctx: &Context<'_>,
        job: i64,
        tag_ids: Vec<i64>,
    ) -> Result<Vec<GqlTag>> {
        let pool = ctx.data::<DbPool>()?;
        let principal = ctx.data::<AuthenticatedUser>()?;

        // The job must exist before any association is written.
        pool.find_job_by_id(job).await.map_err(to_gql)?;

        for tag_id in tag_ids {
            pool.add_tag(job, tag_id).await.map_err(to_gql)?;
        }

        let tags = pool.job_tags(job, principal).await.map_err(to_gql)?;
        Ok(tags.into_iter().map(Into::into).collect())
    }

    /// Detach tags from a job; returns the remaining visible tags.
    async fn remove_tags_from_job(
        &self,
        ctx: &Context<'_>,
        job: i64,
        tag_ids: Vec<i64>,
    ) -> Result<Vec<GqlTag>> {
        let pool = ctx.data::<DbPool>()?;
        let principal = ctx.data::<AuthenticatedUser>()?;

        pool.find_job_by_id(job).await.map_err(to_gql)?;

        for tag_id in tag_ids {
            pool.remove_tag_from_job(job, tag_id).await.map_err(to_gql)?;
        }

        let tags = pool.job_tags(job, principal).await.map_err(to_gql)?;
        Ok(tags.into_iter().map(Into::into).collect())
    }

    /// Store one key of the caller's UI configuration. Returns null on
    /// success, matching the UI contract.
    async fn update_configuration(
        &self,
        ctx: &Context<'_>,
        name: String,
        value: String,
    ) -> Result<Option<String>> {
        let pool = ctx.data::<DbPool>()?;
        let principal = ctx.data::<AuthenticatedUser>()?;

        let value = serde_json::from_str(&value)
            .unwrap_or_else(|_| serde_json::Value::String(value.clone()));

        pool.update_ui_config(&principal.username, &name, value)
            .await
            .map_err(to_gql)?;

        Ok(None)
    }
}
