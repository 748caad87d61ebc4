//! Artifact rendering.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use foundry_intent::{Category, Feature, FeatureFlags};
use regex::{Captures, Regex};
use serde::Serialize;
use tracing::{debug, warn};

use crate::artifact::{GeneratedArtifact, RenderedArtifact, RenderedFile};
use crate::descriptors;
use crate::error::{TemplateError, TemplateResult};
use crate::library::{Snippet, TemplateLibrary};
use crate::params::{self, RenderParams};

/// Port generated services listen on inside their container.
pub const DEFAULT_INTERNAL_PORT: u16 = 8000;

/// Name of the metadata file written into every artifact.
pub const METADATA_FILE: &str = "foundry.json";

const MAIN_GUARD: &str = "\nif __name__ == \"__main__\":";

static LEFTOVER_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").ok());

/// Renders service artifacts from a [`TemplateLibrary`].
#[derive(Debug, Clone)]
pub struct TemplateEngine {
    library: TemplateLibrary,
    work_dir: PathBuf,
    internal_port: u16,
}

impl TemplateEngine {
    /// Create an engine writing artifacts below `work_dir`.
    #[must_use]
    pub fn new(library: TemplateLibrary, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            library,
            work_dir: work_dir.into(),
            internal_port: DEFAULT_INTERNAL_PORT,
        }
    }

    /// Override the in-container port.
    #[must_use]
    pub const fn with_internal_port(mut self, port: u16) -> Self {
        self.internal_port = port;
        self
    }

    /// The library this engine renders from.
    #[must_use]
    pub const fn library(&self) -> &TemplateLibrary {
        &self.library
    }

    /// Directory artifacts are written below.
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Render and write an artifact to `work_dir/<artifact_id>`.
    ///
    /// Nothing is written if rendering fails.
    pub fn render(
        &self,
        artifact_id: &str,
        category: Category,
        features: FeatureFlags,
        params: &RenderParams,
    ) -> TemplateResult<GeneratedArtifact> {
        let rendered = self.compose(category, features, params, Utc::now())?;
        rendered.write_to(self.work_dir.join(artifact_id))
    }

    /// Render an artifact in memory.
    ///
    /// For identical inputs every file is byte-identical except the
    /// `generated_at` field of the metadata file, which is taken from
    /// `generated_at`.
    pub fn compose(
        &self,
        category: Category,
        features: FeatureFlags,
        params: &RenderParams,
        generated_at: DateTime<Utc>,
    ) -> TemplateResult<RenderedArtifact> {
        let template = self
            .library
            .template(category)
            .ok_or_else(|| TemplateError::TemplateNotFound(category.template_name().to_owned()))?;

        let snippets: Vec<(Feature, &Snippet)> = features
            .enabled()
            .filter_map(|feature| match self.library.snippet(feature) {
                Some(snippet) => Some((feature, snippet)),
                None => {
                    debug!(feature = %feature, "no snippet registered, skipping");
                    None
                }
            })
            .collect();

        let routes = claim_routes(
            template.name.as_ref(),
            template.routes.iter().map(AsRef::as_ref),
            &snippets,
        )?;

        let params = params
            .clone()
            .with_default(params::PORT, self.internal_port.to_string())
            .with_default(params::CATEGORY, category.as_str());

        let mut source = template.source.to_string();
        let appended: String = snippets
            .iter()
            .map(|(feature, snippet)| {
                format!("\n\n# feature: {feature}\n{}", snippet.code.trim_end())
            })
            .collect();
        if !appended.is_empty() {
            let at = source.find(MAIN_GUARD).unwrap_or(source.len());
            let (head, tail) = source.split_at(at);
            source = format!("{}{appended}\n{tail}", head.trim_end());
        }

        let server = substitute(&source, &params);
        let unresolved = leftovers(&source, &params);
        for name in &unresolved {
            warn!(template = %template.name, placeholder = %name, "unresolved placeholder");
        }

        let snippet_refs: Vec<&Snippet> = snippets.iter().map(|(_, s)| *s).collect();
        let dependencies = descriptors::dependencies(template, &snippet_refs);
        let port = params.get(params::PORT).unwrap_or_default().to_owned();

        let mut files = vec![
            file("server.py", server),
            file("requirements.txt", descriptors::requirements_txt(&dependencies)),
            file("Dockerfile", descriptors::dockerfile(&port)),
            file(".env.example", descriptors::env_example(&params, &snippet_refs)),
            file(".dockerignore", descriptors::DOCKERIGNORE.to_owned()),
            file(
                "README.md",
                descriptors::readme(template, &params, features, &routes),
            ),
        ];

        let metadata = Metadata {
            service_id: params.get(params::SERVICE_ID),
            service_name: params.get(params::SERVICE_NAME),
            template: template.name.as_ref(),
            category,
            features,
            port: self.internal_port,
            routes: &routes,
            dependencies: &dependencies,
            files: files
                .iter()
                .map(|f| f.path.to_string_lossy().into_owned())
                .collect(),
            unresolved: &unresolved,
            generated_at,
        };
        let mut json = serde_json::to_string_pretty(&metadata)?;
        json.push('\n');
        files.push(file(METADATA_FILE, json));

        debug!(
            template = %template.name,
            features = snippets.len(),
            files = files.len(),
            "artifact composed"
        );

        Ok(RenderedArtifact {
            category,
            features,
            files,
            routes,
            unresolved,
            generated_at,
        })
    }
}

#[derive(Serialize)]
struct Metadata<'a> {
    service_id: Option<&'a str>,
    service_name: Option<&'a str>,
    template: &'a str,
    category: Category,
    features: FeatureFlags,
    port: u16,
    routes: &'a [String],
    dependencies: &'a [String],
    files: Vec<String>,
    unresolved: &'a [String],
    generated_at: DateTime<Utc>,
}

fn file(path: &str, contents: String) -> RenderedFile {
    RenderedFile {
        path: PathBuf::from(path),
        contents,
    }
}

/// Every route may be bound once across the template and its snippets.
fn claim_routes<'a>(
    template: &str,
    template_routes: impl Iterator<Item = &'a str>,
    snippets: &[(Feature, &'a Snippet)],
) -> TemplateResult<Vec<String>> {
    let mut owners: BTreeMap<&str, String> = BTreeMap::new();
    let mut routes = Vec::new();

    let claims = template_routes
        .map(|route| (route, format!("template {template}")))
        .chain(snippets.iter().flat_map(|(feature, snippet)| {
            snippet
                .routes
                .iter()
                .map(move |route| (route.as_ref(), format!("feature {feature}")))
        }));

    for (route, owner) in claims {
        if let Some(first) = owners.get(route) {
            return Err(TemplateError::Conflict {
                route: route.to_owned(),
                first: first.clone(),
                second: owner,
            });
        }
        owners.insert(route, owner);
        routes.push(route.to_owned());
    }
    Ok(routes)
}

/// Replace every literal `{{KEY}}` with its value in one pass, so values are
/// never scanned for placeholders themselves.
fn substitute(source: &str, params: &RenderParams) -> String {
    let Some(pattern) = LEFTOVER_PATTERN.as_ref() else {
        return source.to_owned();
    };
    pattern
        .replace_all(source, |caps: &Captures<'_>| {
            resolve(caps, params).map_or_else(|| caps[0].to_owned(), str::to_owned)
        })
        .into_owned()
}

fn resolve<'p>(caps: &Captures<'_>, params: &'p RenderParams) -> Option<&'p str> {
    let name = &caps[1];
    // Only the exact `{{KEY}}` form is substituted.
    if caps[0].len() != name.len() + 4 {
        return None;
    }
    params.get(name)
}

/// Distinct placeholder names `substitute` leaves in `source`, in order of
/// first appearance.
fn leftovers(source: &str, params: &RenderParams) -> Vec<String> {
    let Some(pattern) = LEFTOVER_PATTERN.as_ref() else {
        return Vec::new();
    };
    let mut names: Vec<String> = Vec::new();
    for capture in pattern.captures_iter(source) {
        if resolve(&capture, params).is_some() {
            continue;
        }
        let name = &capture[1];
        if !names.iter().any(|n| n == name) {
            names.push(name.to_owned());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::ServiceTemplate;
    use chrono::TimeZone;
    use rstest::rstest;

    fn engine() -> TemplateEngine {
        TemplateEngine::new(TemplateLibrary::builtin(), "unused")
    }

    fn params() -> RenderParams {
        RenderParams::for_service(
            "svc-test",
            "Optimize Postgres Queries Service",
            "optimize my postgres queries",
            &["query optimization".to_owned()],
        )
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn contents<'a>(artifact: &'a RenderedArtifact, path: &str) -> &'a str {
        &artifact.file(path).unwrap().contents
    }

    #[rstest]
    #[case(Category::Database)]
    #[case(Category::Api)]
    #[case(Category::Logs)]
    #[case(Category::Security)]
    #[case(Category::Performance)]
    #[case(Category::Generic)]
    fn builtin_templates_resolve_every_placeholder(#[case] category: Category) {
        let features: FeatureFlags = Feature::ALL.into_iter().collect();
        let artifact = engine()
            .compose(category, features, &params(), at(0))
            .unwrap();
        assert!(artifact.unresolved.is_empty(), "{:?}", artifact.unresolved);
        assert!(!contents(&artifact, "server.py").contains("{{"));
    }

    #[test]
    fn output_is_deterministic_apart_from_timestamp() {
        let features = FeatureFlags::none().with(Feature::Alerting);
        let first = engine()
            .compose(Category::Database, features, &params(), at(0))
            .unwrap();
        let second = engine()
            .compose(Category::Database, features, &params(), at(3600))
            .unwrap();

        assert_eq!(first.files.len(), second.files.len());
        for (a, b) in first.files.iter().zip(&second.files) {
            assert_eq!(a.path, b.path);
            if a.path == Path::new(METADATA_FILE) {
                let mut a: serde_json::Value = serde_json::from_str(&a.contents).unwrap();
                let mut b: serde_json::Value = serde_json::from_str(&b.contents).unwrap();
                assert_ne!(a["generated_at"], b["generated_at"]);
                a.as_object_mut().unwrap().remove("generated_at");
                b.as_object_mut().unwrap().remove("generated_at");
                assert_eq!(a, b);
            } else {
                assert_eq!(a.contents, b.contents, "{}", a.path.display());
            }
        }
    }

    #[test]
    fn missing_template_is_reported() {
        let engine = TemplateEngine::new(
            TemplateLibrary::builtin().without(Category::Security),
            "unused",
        );
        let err = engine
            .compose(Category::Security, FeatureFlags::none(), &params(), at(0))
            .unwrap_err();
        assert!(matches!(err, TemplateError::TemplateNotFound(name) if name == "security_scanner"));
    }

    #[test]
    fn snippet_claiming_template_route_conflicts() {
        let library = TemplateLibrary::builtin()
            .with_snippet(Feature::Reporting, Snippet::new("# shadow").route("/analyze"));
        let err = TemplateEngine::new(library, "unused")
            .compose(
                Category::Api,
                FeatureFlags::none().with(Feature::Reporting),
                &params(),
                at(0),
            )
            .unwrap_err();
        match err {
            TemplateError::Conflict {
                route,
                first,
                second,
            } => {
                assert_eq!(route, "/analyze");
                assert_eq!(first, "template api_monitor");
                assert_eq!(second, "feature reporting");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn two_snippets_on_one_route_conflict() {
        let library = TemplateLibrary::builtin()
            .with_snippet(Feature::Caching, Snippet::new("# dup").route("/dashboard"));
        let features = FeatureFlags::none()
            .with(Feature::Visualization)
            .with(Feature::Caching);
        let err = TemplateEngine::new(library, "unused")
            .compose(Category::Generic, features, &params(), at(0))
            .unwrap_err();
        assert!(matches!(err, TemplateError::Conflict { route, .. } if route == "/dashboard"));
    }

    #[test]
    fn snippets_follow_canonical_order_before_main_guard() {
        let features = FeatureFlags::none()
            .with(Feature::Caching)
            .with(Feature::Visualization);
        let artifact = engine()
            .compose(Category::Logs, features, &params(), at(0))
            .unwrap();
        let server = contents(&artifact, "server.py");

        let dashboard = server.find("# feature: visualization").unwrap();
        let cache = server.find("# feature: caching").unwrap();
        let guard = server.find("if __name__ == \"__main__\":").unwrap();
        assert!(dashboard < cache);
        assert!(cache < guard);
        assert_eq!(
            artifact.routes,
            vec!["/health", "/info", "/analyze", "/dashboard", "/cache/stats"]
        );
    }

    #[test]
    fn dependencies_are_deduplicated() {
        let features = FeatureFlags::none()
            .with(Feature::Alerting)
            .with(Feature::MachineLearning);
        let artifact = engine()
            .compose(Category::Database, features, &params(), at(0))
            .unwrap();
        let requirements = contents(&artifact, "requirements.txt");

        assert_eq!(requirements.matches("httpx==").count(), 1);
        assert!(requirements.contains("sqlparse==0.4.4"));
        assert!(requirements.contains("numpy==1.26.3"));
        assert!(requirements.ends_with('\n'));
    }

    #[test]
    fn unresolved_placeholders_are_recorded_not_fatal() {
        let mut template = TemplateLibrary::builtin()
            .template(Category::Generic)
            .cloned()
            .unwrap();
        template.source = format!("{}\n# {{{{ API_TOKEN }}}}\n", template.source).into();
        let engine = TemplateEngine::new(
            TemplateLibrary::builtin().with_template(template),
            "unused",
        );

        let artifact = engine
            .compose(Category::Generic, FeatureFlags::none(), &params(), at(0))
            .unwrap();
        assert_eq!(artifact.unresolved, vec!["API_TOKEN"]);

        let metadata: serde_json::Value =
            serde_json::from_str(contents(&artifact, METADATA_FILE)).unwrap();
        assert_eq!(metadata["unresolved"][0], "API_TOKEN");
    }

    #[test]
    fn placeholders_inside_values_are_left_verbatim() {
        let params = RenderParams::for_service(
            "svc-x",
            "Leak Service",
            "leak {{SERVICE_ID}} and {{PORT}}",
            &[],
        );
        let artifact = engine()
            .compose(Category::Generic, FeatureFlags::none(), &params, at(0))
            .unwrap();

        let server = contents(&artifact, "server.py");
        assert!(server.contains("leak {{SERVICE_ID}} and {{PORT}}"), "{server}");
        assert!(artifact.unresolved.is_empty(), "{:?}", artifact.unresolved);
    }

    #[test]
    fn descriptors_use_internal_port() {
        let artifact = engine()
            .with_internal_port(8100)
            .compose(Category::Api, FeatureFlags::none(), &params(), at(0))
            .unwrap();
        assert!(contents(&artifact, "Dockerfile").contains("EXPOSE 8100"));
        assert!(contents(&artifact, ".env.example").contains("PORT=8100\n"));
        assert!(contents(&artifact, ".env.example").contains("SERVICE_ID=svc-test\n"));
    }

    #[test]
    fn render_writes_and_replaces_directory() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TemplateEngine::new(TemplateLibrary::builtin(), dir.path());
        std::fs::create_dir_all(dir.path().join("svc-test")).unwrap();
        std::fs::write(dir.path().join("svc-test/stale.txt"), "old").unwrap();

        let artifact = engine
            .render(
                "svc-test",
                Category::Performance,
                FeatureFlags::none().with(Feature::Reporting),
                &params(),
            )
            .unwrap();

        assert_eq!(artifact.dir(), dir.path().join("svc-test"));
        assert!(!artifact.dir().join("stale.txt").exists());
        let names: Vec<_> = artifact.files().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "server.py",
                "requirements.txt",
                "Dockerfile",
                ".env.example",
                ".dockerignore",
                "README.md",
                METADATA_FILE
            ]
        );
        for entry in artifact.files() {
            let on_disk = std::fs::metadata(artifact.dir().join(&entry.path)).unwrap();
            assert_eq!(on_disk.len(), entry.size);
        }

        let path = artifact.dir().to_path_buf();
        artifact.discard().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn failed_render_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TemplateEngine::new(TemplateLibrary::empty(), dir.path());
        let err = engine
            .render("svc-none", Category::Api, FeatureFlags::none(), &params())
            .unwrap_err();
        assert!(matches!(err, TemplateError::TemplateNotFound(_)));
        assert!(!dir.path().join("svc-none").exists());
    }

    #[test]
    fn custom_template_is_used() {
        let template = ServiceTemplate {
            name: "echo".into(),
            description: "echo".into(),
            category: Category::Api,
            source: "NAME = \"{{SERVICE_NAME}}\"\n".into(),
            routes: vec!["/echo".into()],
            dependencies: Vec::new(),
            capabilities: Vec::new(),
        };
        let engine = TemplateEngine::new(TemplateLibrary::empty().with_template(template), "unused");
        let artifact = engine
            .compose(Category::Api, FeatureFlags::none(), &params(), at(0))
            .unwrap();
        assert_eq!(
            contents(&artifact, "server.py"),
            "NAME = \"Optimize Postgres Queries Service\"\n"
        );
        assert_eq!(artifact.routes, vec!["/echo"]);
    }
}
