//! GraphQL schema and the `/query` actix route.

pub mod mutation;
pub mod query;
pub mod types;

use async_graphql::{EmptySubscription, Schema};
use async_graphql_actix_web::{GraphQLRequest, GraphQLResponse};
use actix_web::web;
use std::sync::Arc;

use crate::archive::ArchiveStore;
use crate::db::DbPool;
use crate::metricdata::MetricDataRepos;
use crate::models::ClusterRegistry;

pub use mutation::MutationRoot;
pub use query::QueryRoot;

pub type JobSchema = Schema<QueryRoot, MutationRoot, EmptySubscription>;

/// Build the schema with all repositories injected as context data.
pub fn build_schema(
    pool: DbPool,
    registry: Arc<ClusterRegistry>,
    archive: Arc<dyn ArchiveStore>,
    repos: MetricDataRepos,
) -> JobSchema {
    Schema::build(QueryRoot, MutationRoot, EmptySubscription)
        .data(pool)
        .data(registry)
        .data(archive)
        .data(repos)
        .finish()
}

/// POST /query: authenticated GraphQL endpoint. The principal rides along as
/// request data so resolvers can apply visibility rules.
pub async fn graphql_route(
    schema: web::Data<JobSchema>,
    auth: crate::auth::ApiAuth,
    request: GraphQLRequest,
) -> GraphQLResponse {
    let request = request.into_inner().data(auth.user);
    schema.execute(request).await.into()
}

/// Configure the GraphQL route.
pub fn configure_graphql_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/query").route(web::post().to(graphql_route)));
}
