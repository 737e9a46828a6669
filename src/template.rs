//! Template rendering for step commands
//!
//! Commands may reference `{{ branch }}`, `{{ commit }}`, `{{ job }}` and
//! `{{ step }}`. Undefined variables are errors rather than empty strings.

use minijinja::Environment;
use serde::Serialize;
use thiserror::Error;

/// Variables visible to a step command
#[derive(Debug, Clone, Serialize)]
pub struct CommandContext {
    pub branch: String,
    pub commit: String,
    pub job: String,
    pub step: String,
}

/// Template rendering failure
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template syntax error at line {line}: {message}")]
    Syntax { message: String, line: usize },

    #[error("undefined variable in template (known: branch, commit, job, step): {message}")]
    Undefined { message: String },

    #[error("template error: {0}")]
    Render(String),
}

/// Command template engine
///
/// Wraps minijinja with strict undefined handling.
pub struct CommandTemplate {
    env: Environment<'static>,
}

impl Default for CommandTemplate {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandTemplate {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        // Shell scripts keep their trailing newline
        env.set_keep_trailing_newline(true);
        Self { env }
    }

    /// Whether `script` contains template syntax at all
    ///
    /// Plain scripts skip rendering so shell constructs like `${#var}` pass through.
    pub fn is_templated(script: &str) -> bool {
        script.contains("{{") || script.contains("{%")
    }

    /// Render a command for the given context
    pub fn render(&self, script: &str, ctx: &CommandContext) -> Result<String, TemplateError> {
        if !Self::is_templated(script) {
            return Ok(script.to_string());
        }

        self.env
            .render_str(script, minijinja::Value::from_serialize(ctx))
            .map_err(convert_minijinja_error)
    }

    /// Check that a command's template syntax is valid
    pub fn validate(&self, script: &str) -> Result<(), TemplateError> {
        if !Self::is_templated(script) {
            return Ok(());
        }
        self.env
            .template_from_str(script)
            .map(|_| ())
            .map_err(convert_minijinja_error)
    }
}

fn convert_minijinja_error(err: minijinja::Error) -> TemplateError {
    match err.kind() {
        minijinja::ErrorKind::SyntaxError => TemplateError::Syntax {
            message: err.to_string(),
            line: err.line().unwrap_or(0),
        },
        minijinja::ErrorKind::UndefinedError => TemplateError::Undefined {
            message: err.to_string(),
        },
        _ => TemplateError::Render(err.to_string()),
    }
}
