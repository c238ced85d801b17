//! C2 — XML Template Renderer.
//!
//! On construction, scans a template directory and loads every file into a
//! name → template map. Rendering is then a pure in-memory operation against
//! that immutable map; no further disk I/O happens.

use std::collections::HashMap;
use std::path::Path;

use minijinja::Environment;
use serde::Serialize;

use crate::error::{Error, Result};

pub struct TemplateRenderer {
    env: Environment<'static>,
    names: Vec<String>,
}

impl TemplateRenderer {
    /// Scan `dir` for `*.xml.j2` / `*.xml` template files and load them all.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut env = Environment::new();
        let mut names = Vec::new();

        if !dir.exists() {
            tracing::warn!(dir = %dir.display(), "template directory missing; renderer has no templates loaded");
            return Ok(Self { env, names });
        }

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let source = std::fs::read_to_string(&path)?;
            let name = stem.to_string();
            env.add_template_owned(name.clone(), source)
                .map_err(|e| Error::Internal(format!("failed to parse template '{name}': {e}")))?;
            names.push(name);
        }

        tracing::debug!(count = names.len(), dir = %dir.display(), "loaded XML templates");
        Ok(Self { env, names })
    }

    /// `Render(name, params) -> text | NotFound | RenderError`.
    pub fn render<S: Serialize>(&self, name: &str, params: S) -> Result<String> {
        let tmpl = self
            .env
            .get_template(name)
            .map_err(|_| Error::NotFound(format!("template '{name}' not loaded")))?;
        tmpl.render(params).map_err(Error::from)
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn write_template(dir: &Path, name: &str, contents: &str) {
        let mut file = std::fs::File::create(dir.join(name)).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn renders_known_template_with_params() {
        let dir = tempdir();
        write_template(
            &dir,
            "domain.xml",
            "<domain><name>{{ name }}</name><vcpu>{{ vcpus }}</vcpu></domain>",
        );
        let renderer = TemplateRenderer::load_dir(&dir).unwrap();
        let rendered = renderer.render("domain", json!({"name": "test1", "vcpus": 2})).unwrap();
        assert!(rendered.contains("<name>test1</name>"));
        assert!(rendered.contains("<vcpu>2</vcpu>"));
    }

    #[test]
    fn missing_template_is_not_found() {
        let dir = tempdir();
        let renderer = TemplateRenderer::load_dir(&dir).unwrap();
        let err = renderer.render("nonexistent", json!({})).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn missing_directory_yields_empty_renderer() {
        let renderer = TemplateRenderer::load_dir(Path::new("/nonexistent/dir/xyz")).unwrap();
        assert!(renderer.names().is_empty());
    }

    fn tempdir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("vmux-test-templates-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
