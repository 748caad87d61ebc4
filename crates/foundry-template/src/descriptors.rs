//! Files derived from the template, snippets and parameters.

use std::fmt::Write as _;

use foundry_intent::FeatureFlags;

use crate::library::{ServiceTemplate, Snippet, BASE_DEPENDENCIES};
use crate::params::{self, RenderParams};

/// Base, category and feature dependencies, first-seen order, no duplicates.
pub(crate) fn dependencies(template: &ServiceTemplate, snippets: &[&Snippet]) -> Vec<String> {
    let all = BASE_DEPENDENCIES
        .iter()
        .copied()
        .chain(template.dependencies.iter().map(AsRef::as_ref))
        .chain(
            snippets
                .iter()
                .flat_map(|s| s.dependencies.iter().map(AsRef::as_ref)),
        );

    let mut deps: Vec<String> = Vec::new();
    for dep in all {
        if !deps.iter().any(|d| d == dep) {
            deps.push(dep.to_owned());
        }
    }
    deps
}

pub(crate) fn requirements_txt(deps: &[String]) -> String {
    let mut out = deps.join("\n");
    out.push('\n');
    out
}

pub(crate) fn dockerfile(port: &str) -> String {
    format!(
        "FROM python:3.11-slim\n\
         \n\
         WORKDIR /app\n\
         \n\
         COPY requirements.txt .\n\
         RUN pip install --no-cache-dir -r requirements.txt\n\
         \n\
         COPY . .\n\
         \n\
         ENV PORT={port}\n\
         EXPOSE {port}\n\
         \n\
         CMD [\"sh\", \"-c\", \"uvicorn server:app --host 0.0.0.0 --port ${{PORT}}\"]\n"
    )
}

pub(crate) fn env_example(params: &RenderParams, snippets: &[&Snippet]) -> String {
    let mut out = String::new();
    for key in [params::SERVICE_ID, params::SERVICE_NAME, params::PORT] {
        let _ = writeln!(out, "{key}={}", params.get(key).unwrap_or_default());
    }
    for (key, example) in snippets.iter().flat_map(|s| s.env.iter()) {
        let _ = writeln!(out, "{key}={example}");
    }
    out
}

pub(crate) const DOCKERIGNORE: &str = "\
__pycache__/
*.pyc
*.pyo
.env
.venv/
.git/
foundry.json
";

pub(crate) fn readme(
    template: &ServiceTemplate,
    params: &RenderParams,
    features: FeatureFlags,
    routes: &[String],
) -> String {
    let name = params
        .get(params::SERVICE_NAME)
        .unwrap_or(template.name.as_ref());
    let port = params.get(params::PORT).unwrap_or_default();

    let mut out = String::new();
    let _ = writeln!(out, "# {name}\n");
    let _ = writeln!(out, "{}\n", template.description);
    if let Some(description) = params.get(params::DESCRIPTION) {
        let _ = writeln!(out, "> {description}\n");
    }
    let _ = writeln!(out, "- Template: `{}`", template.name);
    let _ = writeln!(out, "- Category: `{}`", template.category);
    if let Some(requirements) = params.get(params::REQUIREMENTS) {
        let _ = writeln!(out, "- Requirements: {requirements}");
    }
    let enabled: Vec<&str> = features.enabled().map(|f| f.as_str()).collect();
    if enabled.is_empty() {
        let _ = writeln!(out, "- Features: none");
    } else {
        let _ = writeln!(out, "- Features: {}", enabled.join(", "));
    }

    let _ = writeln!(out, "\n## Endpoints\n");
    for route in routes {
        let _ = writeln!(out, "- `{route}`");
    }

    let _ = writeln!(out, "\n## Running\n");
    let _ = writeln!(out, "```sh");
    let _ = writeln!(out, "docker build -t {} .", template.name.replace('_', "-"));
    let _ = writeln!(
        out,
        "docker run -p {port}:{port} {}",
        template.name.replace('_', "-")
    );
    let _ = writeln!(out, "curl http://localhost:{port}/health");
    let _ = writeln!(out, "```");
    out
}
