//! Turning a template id plus a context map into a complete HTML document.

use std::{
    fs,
    path::{Path, PathBuf},
};

use handlebars::Handlebars;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// Variables handed to a template.
pub type DocumentContext = Map<String, Value>;

const TEMPLATE_EXTENSIONS: &[&str] = &["html", "hbs"];

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("template `{0}` is not registered")]
    UnknownTemplate(String),
    #[error("template `{id}` is invalid: {reason}")]
    Invalid { id: String, reason: String },
    #[error("template `{id}` failed to render: {reason}")]
    Render { id: String, reason: String },
    #[error("failed to read templates from `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Produces render-ready markup. Implementations must not touch the engine.
pub trait DocumentProducer: Send + Sync {
    fn produce(&self, template_id: &str, context: &DocumentContext)
    -> Result<String, DocumentError>;
}

/// Handlebars-backed producer. Missing variables render as empty strings.
#[derive(Debug)]
pub struct HandlebarsProducer {
    registry: Handlebars<'static>,
}

impl Default for HandlebarsProducer {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlebarsProducer {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.set_dev_mode(false);
        Self { registry }
    }

    /// Load every `*.html` / `*.hbs` file in `dir`; the file stem is the id.
    pub fn from_directory(dir: impl AsRef<Path>) -> Result<Self, DocumentError> {
        let dir = dir.as_ref();
        let io_error = |source| DocumentError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let mut producer = Self::new();
        let mut entries = fs::read_dir(dir)
            .map_err(io_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_error)?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(extension) = path.extension().and_then(|ext| ext.to_str()) else {
                continue;
            };
            if !TEMPLATE_EXTENSIONS.contains(&extension) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };

            let source = fs::read_to_string(&path).map_err(|source| DocumentError::Io {
                path: path.clone(),
                source,
            })?;
            producer.register(id, &source)?;
        }

        debug!(
            target = "application::render::document",
            op = "document::load",
            dir = %dir.display(),
            templates = producer.registry.get_templates().len(),
            "Templates loaded"
        );
        Ok(producer)
    }

    pub fn register(&mut self, id: &str, source: &str) -> Result<(), DocumentError> {
        self.registry
            .register_template_string(id, source)
            .map_err(|err| DocumentError::Invalid {
                id: id.to_string(),
                reason: err.to_string(),
            })
    }

    pub fn has_template(&self, id: &str) -> bool {
        self.registry.has_template(id)
    }
}

impl DocumentProducer for HandlebarsProducer {
    fn produce(
        &self,
        template_id: &str,
        context: &DocumentContext,
    ) -> Result<String, DocumentError> {
        if !self.registry.has_template(template_id) {
            return Err(DocumentError::UnknownTemplate(template_id.to_string()));
        }
        self.registry
            .render(template_id, context)
            .map_err(|err| DocumentError::Render {
                id: template_id.to_string(),
                reason: err.to_string(),
            })
    }
}
