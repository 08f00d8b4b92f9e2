//! Path Rewrite Engine
//!
//! Turns an inbound registry request into the outbound target: resolves the
//! mirror rule for the request's namespace, renders the destination image
//! path from the rule's template and splices it into the original path.

use axum::http::{HeaderMap, HeaderValue, Method, Uri};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use url::{form_urlencoded, Url};

use super::template::{render_mirror_path, ImageView};
use super::{MirrorConfig, MirrorRule, Registry, Resolution};
use crate::server::oci::{ImagePath, ImageReference, V2Route};

/// Outbound header carrying the source image (`registry/project/repo:tag`)
pub const RAW_IMAGE_HEADER: &str = "x-raw-image";
/// Outbound header carrying the rewritten mirror image
pub const MIRROR_IMAGE_HEADER: &str = "x-mirror-image";

const NAMESPACE_PARAM: &str = "ns";

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("No registry route matches {method} {path}")]
    Unroutable { method: Method, path: String },

    #[error("Failed to build outbound URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Source and destination references of a rewritten request, carried from
/// the rewrite phase to response interception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteContext {
    pub source_alias: String,
    pub destination_alias: String,
    pub raw: ImageReference,
    pub mirror: ImageReference,
}

impl RewriteContext {
    /// Stamp `X-Raw-Image` and `X-Mirror-Image` on the outbound request.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        for (name, value) in [
            (RAW_IMAGE_HEADER, self.raw.to_string()),
            (MIRROR_IMAGE_HEADER, self.mirror.to_string()),
        ] {
            match HeaderValue::from_str(&value) {
                Ok(value) => {
                    headers.insert(name, value);
                }
                Err(_) => warn!(header = name, value = %value, "Image reference is not a valid header value"),
            }
        }
    }

    pub fn raw_view(&self) -> ImageView<'_> {
        ImageView::new(&self.raw, &self.source_alias)
    }

    pub fn mirror_view(&self) -> ImageView<'_> {
        ImageView::new(&self.mirror, &self.destination_alias)
    }

    /// Token scope the destination registry expects for this image
    pub fn scope(&self) -> String {
        self.mirror.pull_scope()
    }
}

#[derive(Debug, Clone)]
pub enum Rewrite {
    /// No rule for the namespace: forward to the source registry as-is
    PassThrough { url: Url, source: Arc<Registry> },
    /// Forward to the mirror registry
    Mirror {
        url: Url,
        destination: Arc<Registry>,
        /// Absent for image-less routes (`/v2/`, `/v2/_catalog`) and when the
        /// path template could not be applied
        context: Option<RewriteContext>,
    },
}

impl Rewrite {
    pub fn url(&self) -> &Url {
        match self {
            Rewrite::PassThrough { url, .. } | Rewrite::Mirror { url, .. } => url,
        }
    }
}

/// Compute the outbound target for an inbound request.
pub fn rewrite(config: &MirrorConfig, method: &Method, uri: &Uri) -> Result<Rewrite, RewriteError> {
    let path = uri.path();
    let namespace = namespace_param(uri.query());
    let namespace_ref = namespace.as_deref();

    let (rule, destination) = match config.resolve(namespace_ref) {
        Resolution::PassThrough { source } => {
            warn!(namespace = ?namespace_ref, upstream = %source.host, "No mirror rule, passing through");
            let mut url = Url::parse(&format!("{}{}", source.base_url(), path))?;
            url.set_query(uri.query());
            return Ok(Rewrite::PassThrough { url, source });
        }
        Resolution::Mirror {
            rule, destination, ..
        } => (rule, destination),
    };

    let route = match V2Route::match_path(path) {
        Some(route) if *method == Method::GET || *method == Method::HEAD => route,
        _ => {
            return Err(RewriteError::Unroutable {
                method: method.clone(),
                path: path.to_string(),
            })
        }
    };

    let source_registry = namespace_ref
        .filter(|ns| !ns.is_empty())
        .unwrap_or(super::DEFAULT_NAMESPACE);

    let (path, context) = match route {
        V2Route::Base | V2Route::Catalog => (path.to_string(), None),
        V2Route::Image(image) => {
            match rewrite_image_path(rule, source_registry, &destination, path, &image) {
                Some((rewritten, context)) => (rewritten, Some(context)),
                None => (path.to_string(), None),
            }
        }
    };

    let mut url = Url::parse(&format!("{}{}", destination.base_url(), path))?;
    url.set_query(Some(&replace_namespace(uri.query(), &destination.host)));

    if let Some(context) = &context {
        info!(raw = %context.raw, mirror = %context.mirror, "Rewriting to mirror");
    }

    Ok(Rewrite::Mirror {
        url,
        destination,
        context,
    })
}

/// Render the destination image and splice it into `path`.
///
/// Returns `None` (after logging) when the template cannot be applied; the
/// request then goes to the mirror host with its original path.
fn rewrite_image_path(
    rule: &MirrorRule,
    source_registry: &str,
    destination: &Registry,
    path: &str,
    image: &ImagePath,
) -> Option<(String, RewriteContext)> {
    let raw = ImageReference::from_route(source_registry, path, image);

    let rendered = match render_mirror_path(
        &rule.path_template,
        &ImageView::new(&raw, &rule.source_alias),
    ) {
        Ok(rendered) => rendered,
        Err(e) => {
            error!(raw = %raw, error = ?e, "Failed to render mirror path");
            return None;
        }
    };

    let mut mirror = match ImageReference::parse_relative(&destination.host, &rendered) {
        Ok(mirror) => mirror,
        Err(e) => {
            error!(raw = %raw, rendered = %rendered, error = %e, "Rendered mirror path is not an image reference");
            return None;
        }
    };
    if mirror.tag.is_empty() {
        mirror.tag = raw.tag.clone();
    }

    let reference = image.reference.as_ref().map(|_| mirror.tag.as_str());
    let rewritten = image.splice(path, &mirror.name(), reference);

    Some((
        rewritten,
        RewriteContext {
            source_alias: rule.source_alias.clone(),
            destination_alias: rule.destination_alias.clone(),
            raw,
            mirror,
        },
    ))
}

fn namespace_param(query: Option<&str>) -> Option<String> {
    form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == NAMESPACE_PARAM)
        .map(|(_, value)| value.into_owned())
}

fn replace_namespace(query: Option<&str>, host: &str) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
        if key != NAMESPACE_PARAM {
            serializer.append_pair(&key, &value);
        }
    }
    serializer.append_pair(NAMESPACE_PARAM, host);
    serializer.finish()
}
