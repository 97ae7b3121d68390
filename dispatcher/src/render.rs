use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

/// token -> replacement, applied in key order
///
/// No key may be a substring of another one, otherwise the result depends on
/// the replacement order.
pub type Placeholders = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Template not found at {0:?}")]
    TemplateNotFound(PathBuf),
    #[error("Failed to render {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Fills a job template with per-window values and writes it to a fixed location.
#[derive(Debug, Clone)]
pub struct Renderer {
    template: PathBuf,
    output: PathBuf,
}

impl Renderer {
    pub fn new(template: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            template: template.into(),
            output: output.into(),
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// render the template, overwrite the output file and return the rendered document
    pub fn render(&self, placeholders: &Placeholders) -> Result<String, RenderError> {
        let template = fs::read_to_string(&self.template).map_err(|source| {
            if source.kind() == ErrorKind::NotFound {
                RenderError::TemplateNotFound(self.template.clone())
            } else {
                RenderError::Io {
                    path: self.template.clone(),
                    source,
                }
            }
        })?;

        let document = template
            .split_inclusive('\n')
            .map(|line| replace_all(line, placeholders))
            .collect::<String>();

        fs::write(&self.output, &document).map_err(|source| RenderError::Io {
            path: self.output.clone(),
            source,
        })?;

        debug!(output = ?self.output, "Rendered job descriptor");

        Ok(document)
    }
}

/// replace every occurrence of every key, keys that never occur are ignored
pub fn replace_all(text: &str, placeholders: &Placeholders) -> String {
    placeholders
        .iter()
        .fold(text.to_owned(), |text, (key, value)| text.replace(key.as_str(), value))
}
