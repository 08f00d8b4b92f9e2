use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::route::ImagePath;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("Image reference has no registry separator: {0}")]
    MissingRegistry(String),

    #[error("Image reference has no repository separator: {0}")]
    MissingRepository(String),

    #[error("Image reference has an empty repository: {0}")]
    EmptyRepository(String),
}

/// Registry image coordinate in `registry/project/repository:tag` form.
///
/// `project` holds the `/`-joined middle segments and may be empty; `tag`
/// may hold a digest (`sha256:...`) or be empty for requests that carry
/// neither (e.g. tag listings).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImageReference {
    pub registry: String,
    pub project: String,
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    /// Parse `registry/project/repository:tag`.
    ///
    /// The registry ends at the first `/`, the repository starts after the
    /// last `/`, and the tag starts at the first `:` after that. A missing tag
    /// yields an empty `tag` rather than an error.
    pub fn parse(image: &str) -> Result<Self, ReferenceError> {
        let first_slash = image
            .find('/')
            .ok_or_else(|| ReferenceError::MissingRegistry(image.to_string()))?;
        let last_slash = image.rfind('/').unwrap_or(first_slash);
        if last_slash == first_slash {
            return Err(ReferenceError::MissingRepository(image.to_string()));
        }

        let name = &image[last_slash + 1..];
        let (repository, tag) = name.split_once(':').unwrap_or((name, ""));
        if repository.is_empty() {
            return Err(ReferenceError::EmptyRepository(image.to_string()));
        }

        Ok(Self {
            registry: image[..first_slash].to_string(),
            project: image[first_slash + 1..last_slash].to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Parse a registry-relative path such as `docker-hub/alpine:latest`.
    ///
    /// Single-segment paths are legal and produce an empty project.
    pub fn parse_relative(registry: &str, path: &str) -> Result<Self, ReferenceError> {
        if path.contains('/') {
            Self::parse(&format!("{}/{}", registry, path))
        } else {
            Self::parse(&format!("{}//{}", registry, path))
        }
    }

    /// Build a reference from a matched v2 route.
    pub fn from_route(registry: &str, path: &str, route: &ImagePath) -> Self {
        Self {
            registry: registry.to_string(),
            project: route.project(path).to_string(),
            repository: route.repository(path).to_string(),
            tag: route.reference(path).unwrap_or_default().to_string(),
        }
    }

    /// Repository name as used in v2 paths and token scopes (`project/repo`).
    pub fn name(&self) -> String {
        if self.project.is_empty() {
            self.repository.clone()
        } else {
            format!("{}/{}", self.project, self.repository)
        }
    }

    /// Pull scope for the registry token service.
    pub fn pull_scope(&self) -> String {
        format!("repository:{}:pull", self.name())
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}",
            self.registry, self.project, self.repository, self.tag
        )
    }
}

impl FromStr for ImageReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
