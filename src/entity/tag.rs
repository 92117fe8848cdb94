//! Tag entity for SeaORM.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "tag")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub tag_type: String,
    pub tag_name: String,
    /// "global", a username, or "admin"
    pub tag_scope: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::job_tag::Entity")]
    JobTags,
}

impl Related<super::job_tag::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::JobTags.def()
    }
}

impl Related<super::job::Entity> for Entity {
    fn to() -> RelationDef {
        super::job_tag::Relation::Job.def()
    }

    fn via() -> Option<RelationDef> {
        Some(super::job_tag::Relation::Tag.def().rev())
    }
}

impl ActiveModelBehavior for ActiveModel {}
