//! Axum surface for the row accessors: resolves a property's image cell into
//! display URLs, including cells that are still truncated.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use imgfix_core::{DerivationSource, DerivedUrls, UrlDeriver};
use imgfix_reconstruct::ImgfixConfig;
use imgfix_storage::TargetStore;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "imgfix-web";

#[derive(Clone)]
pub struct AppState {
    pub target: Arc<dyn TargetStore>,
    pub deriver: UrlDeriver,
}

impl AppState {
    pub fn new(target: Arc<dyn TargetStore>, deriver: UrlDeriver) -> Self {
        Self { target, deriver }
    }
}

#[derive(Debug, Serialize)]
pub struct ImageResponse {
    pub property_id: String,
    pub url: String,
    pub source: DerivationSource,
    pub placeholder: bool,
}

#[derive(Debug, Serialize)]
pub struct ImagesResponse {
    pub property_id: String,
    pub urls: Vec<String>,
    pub source: DerivationSource,
    pub placeholder: bool,
}

#[derive(Template)]
#[template(
    source = r#"<!doctype html>
<html>
<head><title>Property {{ property_id }}</title></head>
<body>
<h1>Property {{ property_id }}</h1>
{% if placeholder %}<p>No image available.</p>{% endif %}
<ul>
{% for url in urls %}<li><img src="{{ url }}" alt="Property {{ property_id }} image {{ loop.index }}"></li>
{% endfor %}</ul>
</body>
</html>"#,
    ext = "html"
)]
struct GalleryTemplate {
    property_id: String,
    urls: Vec<String>,
    placeholder: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/properties/{id}", get(gallery_handler))
        .route("/properties/{id}/image", get(image_handler))
        .route("/properties/{id}/images", get(images_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = ImgfixConfig::from_env();
    let deriver = UrlDeriver::new(config.load_rules()?);
    let target = config.connect_target().await?;
    let state = AppState::new(Arc::new(target), deriver);
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "serving property images");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

/// Look the row up and derive its URLs; `Err` is a ready response.
async fn derive_for(state: &AppState, property_id: &str) -> Result<DerivedUrls, Response> {
    match state.target.get(property_id).await {
        Ok(Some(row)) => Ok(state.deriver.derive(row.primary_image.as_deref())),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            format!("unknown property {property_id}"),
        )
            .into_response()),
        Err(err) => Err(server_error(err.into())),
    }
}

async fn image_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match derive_for(&state, &id).await {
        Ok(derived) => Json(ImageResponse {
            url: derived.primary().to_string(),
            property_id: id,
            source: derived.source,
            placeholder: derived.placeholder,
        })
        .into_response(),
        Err(resp) => resp,
    }
}

async fn images_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match derive_for(&state, &id).await {
        Ok(derived) => Json(ImagesResponse {
            property_id: id,
            urls: derived.urls,
            source: derived.source,
            placeholder: derived.placeholder,
        })
        .into_response(),
        Err(resp) => resp,
    }
}

async fn gallery_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match derive_for(&state, &id).await {
        Ok(derived) => render_html(GalleryTemplate {
            property_id: id,
            urls: derived.urls,
            placeholder: derived.placeholder,
        }),
        Err(resp) => resp,
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Server error: {err}"),
    )
        .into_response()
}
