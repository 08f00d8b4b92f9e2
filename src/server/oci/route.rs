//! Registry v2 route matching
//!
//! Only the read-side routes a puller uses are recognised:
//! - `/v2/` - API version check
//! - `/v2/_catalog` - repository catalog
//! - `/v2/<name>/manifests/<reference>`
//! - `/v2/<name>/blobs/<digest>`
//! - `/v2/<name>/tags/list`
//!
//! Matches carry byte ranges into the original path so the rewrite engine can
//! splice replacement tokens in place instead of searching for them.

use std::ops::Range;

const V2_PREFIX: &str = "/v2/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageEndpoint {
    Manifest,
    Blob,
    TagList,
}

/// Byte offsets of the image coordinates inside a matched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePath {
    pub endpoint: ImageEndpoint,
    /// `project/repository` span; the project part may be empty.
    pub name: Range<usize>,
    pub project: Range<usize>,
    pub repository: Range<usize>,
    pub reference: Option<Range<usize>>,
}

impl ImagePath {
    pub fn project<'a>(&self, path: &'a str) -> &'a str {
        &path[self.project.clone()]
    }

    pub fn repository<'a>(&self, path: &'a str) -> &'a str {
        &path[self.repository.clone()]
    }

    pub fn reference<'a>(&self, path: &'a str) -> Option<&'a str> {
        self.reference.clone().map(|r| &path[r])
    }

    /// Rebuild `path` with the image name and reference replaced positionally.
    ///
    /// Static segments (the `/v2/` prefix and the endpoint keyword) are copied
    /// from the original path untouched, so a replacement token that happens to
    /// equal one of them cannot corrupt the result.
    pub fn splice(&self, path: &str, name: &str, reference: Option<&str>) -> String {
        let mut out = String::with_capacity(path.len() + name.len());
        out.push_str(&path[..self.name.start]);
        out.push_str(name);
        match (&self.reference, reference) {
            (Some(span), Some(reference)) => {
                out.push_str(&path[self.name.end..span.start]);
                out.push_str(reference);
                out.push_str(&path[span.end..]);
            }
            _ => out.push_str(&path[self.name.end..]),
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum V2Route {
    Base,
    Catalog,
    Image(ImagePath),
}

impl V2Route {
    /// Match a request path against the known route shapes.
    pub fn match_path(path: &str) -> Option<Self> {
        if path == "/v2" || path == V2_PREFIX {
            return Some(V2Route::Base);
        }

        let rest = path.strip_prefix(V2_PREFIX)?;
        if rest == "_catalog" {
            return Some(V2Route::Catalog);
        }

        let offset = V2_PREFIX.len();

        if let Some(name) = rest.strip_suffix("/tags/list") {
            return image_path(ImageEndpoint::TagList, offset, name, None);
        }

        for (keyword, endpoint) in [
            ("/manifests/", ImageEndpoint::Manifest),
            ("/blobs/", ImageEndpoint::Blob),
        ] {
            if let Some(pos) = rest.rfind(keyword) {
                let reference = &rest[pos + keyword.len()..];
                // A repository component may itself be named after a keyword
                if reference.is_empty() || reference.contains('/') {
                    continue;
                }
                let start = offset + pos + keyword.len();
                return image_path(
                    endpoint,
                    offset,
                    &rest[..pos],
                    Some(start..start + reference.len()),
                );
            }
        }

        None
    }
}

fn image_path(
    endpoint: ImageEndpoint,
    offset: usize,
    name: &str,
    reference: Option<Range<usize>>,
) -> Option<V2Route> {
    if name.is_empty() || name.starts_with('/') || name.ends_with('/') {
        return None;
    }

    let start = offset;
    let end = offset + name.len();
    let (project, repository) = match name.rfind('/') {
        Some(i) => (start..start + i, start + i + 1..end),
        None => (start..start, start..end),
    };

    Some(V2Route::Image(ImagePath {
        endpoint,
        name: start..end,
        project,
        repository,
        reference,
    }))
}
