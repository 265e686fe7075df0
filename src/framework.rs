//! Target test frameworks and their invocation templates.
//!
//! Framework selection is a closed set. Each variant maps to a command
//! template in which `{path}` is replaced by the test artifact path.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Placeholder substituted with the artifact path in invocation templates.
pub const PATH_PLACEHOLDER: &str = "{path}";

/// A supported end-to-end test framework.
///
/// # Example
///
/// ```
/// use mender::framework::Framework;
///
/// assert_eq!(Framework::PlaywrightJs.to_string(), "playwright-js");
/// assert_eq!(Framework::Cypress.language(), "javascript");
/// ```
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framework {
    /// Cypress specs run through the project's `cy-run` script
    Cypress,
    /// Playwright Test (JavaScript / TypeScript)
    PlaywrightJs,
    /// Playwright for Python, run with pytest
    PlaywrightPython,
}

impl std::fmt::Display for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Framework::Cypress => write!(f, "cypress"),
            Framework::PlaywrightJs => write!(f, "playwright-js"),
            Framework::PlaywrightPython => write!(f, "playwright-python"),
        }
    }
}

impl Framework {
    /// All supported frameworks.
    pub const ALL: [Framework; 3] = [
        Framework::Cypress,
        Framework::PlaywrightJs,
        Framework::PlaywrightPython,
    ];

    /// Source language of test files written for this framework.
    #[must_use]
    pub fn language(&self) -> &'static str {
        match self {
            Framework::Cypress | Framework::PlaywrightJs => "javascript",
            Framework::PlaywrightPython => "python",
        }
    }

    /// Default invocation template for this framework.
    #[must_use]
    pub fn default_template(&self) -> &'static str {
        match self {
            Framework::Cypress => "yarn run cy-run -b electron --headed --spec {path}",
            Framework::PlaywrightJs => "npx playwright test {path}",
            Framework::PlaywrightPython => "pytest {path}",
        }
    }

    /// Infer the framework from a test file name.
    ///
    /// ```
    /// use mender::framework::Framework;
    ///
    /// assert_eq!(Framework::infer("cypress/e2e/login.cy.js"), Some(Framework::Cypress));
    /// assert_eq!(Framework::infer("tests/login.spec.ts"), Some(Framework::PlaywrightJs));
    /// assert_eq!(Framework::infer("tests/test_login.py"), Some(Framework::PlaywrightPython));
    /// assert_eq!(Framework::infer("tests/conftest.py"), None);
    /// assert_eq!(Framework::infer("README.md"), None);
    /// ```
    #[must_use]
    pub fn infer(path: impl AsRef<Path>) -> Option<Framework> {
        let name = path.as_ref().file_name()?.to_str()?.to_lowercase();

        if [".cy.js", ".cy.ts", ".cy.jsx", ".cy.tsx"]
            .iter()
            .any(|suffix| name.ends_with(suffix))
        {
            return Some(Framework::Cypress);
        }
        if let Some(stem) = name.strip_suffix(".py") {
            if stem.starts_with("test_") || stem.ends_with("_test") {
                return Some(Framework::PlaywrightPython);
            }
            return None;
        }
        let js_like = [".js", ".ts", ".mjs", ".cjs"]
            .iter()
            .any(|ext| name.ends_with(ext));
        if js_like && (name.contains(".spec.") || name.contains(".test.")) {
            return Some(Framework::PlaywrightJs);
        }
        None
    }
}

/// Expand an invocation template into a program and its arguments.
///
/// The template is split on whitespace; every `{path}` occurrence is
/// replaced with the artifact path. Returns `None` for an empty template.
#[must_use]
pub fn render_template(template: &str, path: &Path) -> Option<(String, Vec<String>)> {
    let path = path.display().to_string();
    let mut parts = template
        .split_whitespace()
        .map(|part| part.replace(PATH_PLACEHOLDER, &path));
    let program = parts.next()?;
    Some((program, parts.collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_framework_display() {
        assert_eq!(Framework::Cypress.to_string(), "cypress");
        assert_eq!(Framework::PlaywrightJs.to_string(), "playwright-js");
        assert_eq!(Framework::PlaywrightPython.to_string(), "playwright-python");
    }

    #[test]
    fn test_framework_serde_kebab_case() {
        let json = serde_json::to_string(&Framework::PlaywrightPython).unwrap();
        assert_eq!(json, "\"playwright-python\"");
        let parsed: Framework = serde_json::from_str("\"playwright-js\"").unwrap();
        assert_eq!(parsed, Framework::PlaywrightJs);
    }

    #[test]
    fn test_every_template_has_path_placeholder() {
        for framework in Framework::ALL {
            assert!(framework.default_template().contains(PATH_PLACEHOLDER));
        }
    }

    #[test]
    fn test_infer_ignores_plain_js() {
        assert_eq!(Framework::infer("src/app.js"), None);
        assert_eq!(
            Framework::infer("e2e/checkout.test.mjs"),
            Some(Framework::PlaywrightJs)
        );
    }

    #[test]
    fn test_infer_only_python_test_modules() {
        assert_eq!(
            Framework::infer("tests/test_checkout.py"),
            Some(Framework::PlaywrightPython)
        );
        assert_eq!(
            Framework::infer("tests/checkout_test.py"),
            Some(Framework::PlaywrightPython)
        );
        assert_eq!(Framework::infer("tests/conftest.py"), None);
        assert_eq!(Framework::infer("tests/helpers.py"), None);
        assert_eq!(Framework::infer("setup.py"), None);
    }

    #[test]
    fn test_render_template_cypress() {
        let path = PathBuf::from("cypress/e2e/login.cy.js");
        let (program, args) =
            render_template(Framework::Cypress.default_template(), &path).unwrap();
        assert_eq!(program, "yarn");
        assert_eq!(
            args,
            vec![
                "run",
                "cy-run",
                "-b",
                "electron",
                "--headed",
                "--spec",
                "cypress/e2e/login.cy.js"
            ]
        );
    }

    #[test]
    fn test_render_template_empty() {
        assert!(render_template("   ", Path::new("x")).is_none());
    }
}
