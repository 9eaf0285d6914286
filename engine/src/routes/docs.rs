//! OpenAPI documentation: merges every route group's schema into one swagger-ui instance.

use axum::Router;
use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use super::basic::BasicApiDocs;
use super::events::EventApiDocs;
use super::jobs::JobApiDocs;
use super::system::SystemApiDocs;
use crate::utils::AppState;

/// Registers the `basic` security scheme used by routes that require it
pub struct OpenApiSecurity;

impl Modify for OpenApiSecurity {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.as_mut().unwrap();
        components.add_security_scheme(
            "basic",
            SecurityScheme::Http(Http::new(HttpAuthScheme::Basic)),
        );
    }
}

/// Mount the swagger-ui, merging every route group's OpenAPI schema
pub fn mount(router: Router<AppState>) -> Router<AppState> {
    router.merge(
        SwaggerUi::new("/api/docs/swagger-ui")
            .url("/api/openapi.json", BasicApiDocs::openapi())
            .url("/api/events/openapi.json", EventApiDocs::openapi())
            .url("/api/jobs/openapi.json", JobApiDocs::openapi())
            .url("/api/system/openapi.json", SystemApiDocs::openapi()),
    )
}
