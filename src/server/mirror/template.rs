use serde::Serialize;
use std::fmt;
use tera::{Context, Tera};

use crate::server::oci::ImageReference;

/// A Tera template compiled once at configuration load.
///
/// Each template owns its own `Tera` instance holding a single entry, so
/// rendering never touches shared mutable state.
#[derive(Clone)]
pub struct CompiledTemplate {
    name: &'static str,
    source: String,
    tera: Tera,
}

impl CompiledTemplate {
    pub fn compile(name: &'static str, source: &str) -> Result<Self, tera::Error> {
        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        tera.add_raw_template(name, source)?;
        Ok(Self {
            name,
            source: source.to_string(),
            tera,
        })
    }

    pub fn render(&self, context: &Context) -> Result<String, tera::Error> {
        self.tera.render(self.name, context)
    }
}

impl fmt::Debug for CompiledTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledTemplate")
            .field("name", &self.name)
            .field("source", &self.source)
            .finish()
    }
}

/// Template view of an image reference.
#[derive(Debug, Clone, Serialize)]
pub struct ImageView<'a> {
    pub registry: &'a str,
    pub alias: &'a str,
    pub project: &'a str,
    pub repo: &'a str,
    pub tag: &'a str,
}

impl<'a> ImageView<'a> {
    pub fn new(reference: &'a ImageReference, alias: &'a str) -> Self {
        Self {
            registry: &reference.registry,
            alias,
            project: &reference.project,
            repo: &reference.repository,
            tag: &reference.tag,
        }
    }
}

/// Render the destination path for `source`.
///
/// Surrounding slashes and whitespace are trimmed so templates may be written
/// either as `docker-hub/{{ repo }}` or `/docker-hub/{{ repo }}`.
pub fn render_mirror_path(
    template: &CompiledTemplate,
    source: &ImageView<'_>,
) -> Result<String, tera::Error> {
    let context = Context::from_serialize(source)?;
    let rendered = template.render(&context)?;
    Ok(rendered.trim().trim_matches('/').to_string())
}

/// Render the on-miss command line.
///
/// The context exposes `raw`/`mirror` as rendered strings and `Raw`/`Mirror`
/// as objects. An empty result means no recovery action.
pub fn render_on_missing(
    template: &CompiledTemplate,
    raw: &ImageView<'_>,
    raw_reference: &ImageReference,
    mirror: &ImageView<'_>,
    mirror_reference: &ImageReference,
) -> Result<String, tera::Error> {
    let mut context = Context::new();
    context.insert("Raw", raw);
    context.insert("Mirror", mirror);
    context.insert("raw", &raw_reference.to_string());
    context.insert("mirror", &mirror_reference.to_string());
    Ok(template.render(&context)?.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alpine() -> ImageReference {
        ImageReference::parse("docker.io/library/alpine:latest").unwrap()
    }

    fn mirror() -> ImageReference {
        ImageReference::parse("mirror.example.com/docker-hub/library/alpine:latest").unwrap()
    }

    #[test]
    fn test_render_mirror_path() {
        let template =
            CompiledTemplate::compile("path", "/docker-hub/{{ project }}/{{ repo }}/").unwrap();
        let source = alpine();
        let rendered = render_mirror_path(&template, &ImageView::new(&source, "dockerhub")).unwrap();
        assert_eq!(rendered, "docker-hub/library/alpine");
    }

    #[test]
    fn test_render_mirror_path_with_alias_and_tag() {
        let template =
            CompiledTemplate::compile("path", "{{ alias }}/{{ repo }}:{{ tag }}").unwrap();
        let source = alpine();
        let rendered = render_mirror_path(&template, &ImageView::new(&source, "hub")).unwrap();
        assert_eq!(rendered, "hub/alpine:latest");
    }

    #[test]
    fn test_compile_rejects_invalid_template() {
        assert!(CompiledTemplate::compile("path", "{{ project ").is_err());
    }

    #[test]
    fn test_render_fails_on_unknown_variable() {
        let template = CompiledTemplate::compile("path", "{{ namespace }}/{{ repo }}").unwrap();
        let source = alpine();
        assert!(render_mirror_path(&template, &ImageView::new(&source, "")).is_err());
    }

    #[test]
    fn test_render_on_missing_is_deterministic() {
        let template = CompiledTemplate::compile(
            "on_missing",
            "pull-image {{ raw }} push-to {{ mirror }}",
        )
        .unwrap();
        let (raw, mirror) = (alpine(), mirror());
        let render = || {
            render_on_missing(
                &template,
                &ImageView::new(&raw, "dockerhub"),
                &raw,
                &ImageView::new(&mirror, "mirror"),
                &mirror,
            )
            .unwrap()
        };

        let first = render();
        assert_eq!(
            first,
            "pull-image docker.io/library/alpine:latest push-to mirror.example.com/docker-hub/library/alpine:latest"
        );
        assert_eq!(first, render());
    }

    #[test]
    fn test_render_on_missing_object_fields() {
        let template = CompiledTemplate::compile(
            "on_missing",
            "sync {{ Raw.alias }}/{{ Raw.repo }} {{ Mirror.project }}",
        )
        .unwrap();
        let (raw, mirror) = (alpine(), mirror());
        let rendered = render_on_missing(
            &template,
            &ImageView::new(&raw, "dockerhub"),
            &raw,
            &ImageView::new(&mirror, "mirror"),
            &mirror,
        )
        .unwrap();
        assert_eq!(rendered, "sync dockerhub/alpine docker-hub/library");
    }

    #[test]
    fn test_blank_on_missing_renders_empty() {
        let template = CompiledTemplate::compile("on_missing", "  {# disabled #}  ").unwrap();
        let (raw, mirror) = (alpine(), mirror());
        let rendered = render_on_missing(
            &template,
            &ImageView::new(&raw, ""),
            &raw,
            &ImageView::new(&mirror, ""),
            &mirror,
        )
        .unwrap();
        assert!(rendered.is_empty());
    }
}
