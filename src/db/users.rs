//! User repository: lookups for authentication and the CLI user management
//! pathway.

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};

use crate::entity::user;
use crate::error::{AppError, AppResult};
use crate::models::{Role, UserRecord};

use super::DbPool;

/// Parse the JSONB role array of a user row into the closed role set.
pub fn parse_roles(value: &serde_json::Value) -> Vec<Role> {
    value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .filter_map(Role::parse)
                .collect()
        })
        .unwrap_or_default()
}

/// Parse the JSONB project array of a user row.
pub fn parse_projects(value: &serde_json::Value) -> Vec<String> {
    value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

impl DbPool {
    pub async fn get_user(&self, username: &str) -> AppResult<Option<user::Model>> {
        user::Entity::find_by_id(username)
            .one(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to get user: {}", e)))
    }

    /// Resolve an API token (by its sha256 hex) to the owning user.
    pub async fn find_user_by_token_hash(&self, token_hash: &str) -> AppResult<Option<user::Model>> {
        user::Entity::find()
            .filter(user::Column::TokenHash.eq(token_hash))
            .one(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to look up token: {}", e)))
    }

    /// Create a user; `token_hash` is the sha256 hex of its API token.
    pub async fn add_user(&self, record: &UserRecord, token_hash: Option<String>) -> AppResult<()> {
        if self.get_user(&record.username).await?.is_some() {
            return Err(AppError::Duplicate(format!(
                "user '{}' already exists",
                record.username
            )));
        }

        let roles: Vec<&str> = record.roles.iter().map(|r| r.as_str()).collect();
        let model = user::ActiveModel {
            username: Set(record.username.clone()),
            name: Set(record.name.clone()),
            email: Set(record.email.clone()),
            roles: Set(serde_json::json!(roles)),
            projects: Set(serde_json::json!(record.projects)),
            token_hash: Set(token_hash),
            ui_config: Set(None),
            created_at: Set(Utc::now()),
        };

        model
            .insert(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to insert user: {}", e)))?;

        Ok(())
    }

    pub async fn del_user(&self, username: &str) -> AppResult<()> {
        let result = user::Entity::delete_by_id(username)
            .exec(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to delete user: {}", e)))?;

        if result.rows_affected == 0 {
            return Err(AppError::NotFound(format!("User '{}'", username)));
        }
        Ok(())
    }

    /// Set one key in the user's UI configuration (updateConfiguration).
    pub async fn update_ui_config(
        &self,
        username: &str,
        key: &str,
        value: serde_json::Value,
    ) -> AppResult<()> {
        let model = self
            .get_user(username)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User '{}'", username)))?;

        let mut config = model
            .ui_config
            .clone()
            .unwrap_or_else(|| serde_json::json!({}));
        if let Some(map) = config.as_object_mut() {
            map.insert(key.to_string(), value);
        }

        let mut active: user::ActiveModel = model.into();
        active.ui_config = Set(Some(config));
        active
            .update(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to update ui config: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roles() {
        let roles = parse_roles(&serde_json::json!(["admin", "api", "bogus"]));
        assert_eq!(roles, vec![Role::Admin, Role::Api]);
        assert!(parse_roles(&serde_json::json!({})).is_empty());
    }

    #[test]
    fn test_parse_projects() {
        let projects = parse_projects(&serde_json::json!(["p1", "p2"]));
        assert_eq!(projects, vec!["p1".to_string(), "p2".to_string()]);
    }
}
