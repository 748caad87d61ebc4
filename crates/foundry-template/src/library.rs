//! Built-in service templates and feature snippets.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

use foundry_intent::{Category, Feature};
use serde::Serialize;

/// Dependencies every generated service needs.
pub(crate) const BASE_DEPENDENCIES: &[&str] = &[
    "fastapi==0.109.0",
    "uvicorn==0.27.0",
    "pydantic==2.5.0",
    "httpx==0.25.0",
];

/// A category template: the primary source file plus what it binds.
#[derive(Debug, Clone)]
pub struct ServiceTemplate {
    /// Template identifier, e.g. `database_analyzer`.
    pub name: Cow<'static, str>,
    /// Short description for catalogues and usage docs.
    pub description: Cow<'static, str>,
    /// Category this template renders.
    pub category: Category,
    /// Primary source with `{{PLACEHOLDER}}` markers.
    pub source: Cow<'static, str>,
    /// External routes bound by the source.
    pub routes: Vec<Cow<'static, str>>,
    /// Category-specific package requirements.
    pub dependencies: Vec<Cow<'static, str>>,
    /// Capabilities advertised in the catalogue.
    pub capabilities: Vec<Cow<'static, str>>,
}

/// Code and configuration appended when a feature is enabled.
#[derive(Debug, Clone)]
pub struct Snippet {
    /// Code appended to the primary source.
    pub code: Cow<'static, str>,
    /// External routes bound by the code.
    pub routes: Vec<Cow<'static, str>>,
    /// Extra package requirements.
    pub dependencies: Vec<Cow<'static, str>>,
    /// Extra environment variables with example values.
    pub env: Vec<(Cow<'static, str>, Cow<'static, str>)>,
}

impl Snippet {
    /// Create a snippet with the given code and no routes or dependencies.
    #[must_use]
    pub fn new(code: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: code.into(),
            routes: Vec::new(),
            dependencies: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Declare a route bound by this snippet.
    #[must_use]
    pub fn route(mut self, route: impl Into<Cow<'static, str>>) -> Self {
        self.routes.push(route.into());
        self
    }

    /// Declare a package requirement.
    #[must_use]
    pub fn dependency(mut self, dependency: impl Into<Cow<'static, str>>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    /// Declare an environment variable.
    #[must_use]
    pub fn env(
        mut self,
        key: impl Into<Cow<'static, str>>,
        example: impl Into<Cow<'static, str>>,
    ) -> Self {
        self.env.push((key.into(), example.into()));
        self
    }
}

/// A catalogue listing entry.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogueEntry {
    /// Template identifier.
    pub name: String,
    /// Short description.
    pub description: String,
    /// Category rendered by the template.
    pub category: Category,
    /// Advertised capabilities.
    pub capabilities: Vec<String>,
}

/// The set of templates and snippets available to the engine.
#[derive(Debug, Clone)]
pub struct TemplateLibrary {
    templates: HashMap<Category, ServiceTemplate>,
    snippets: BTreeMap<Feature, Snippet>,
}

impl TemplateLibrary {
    /// A library with no templates or snippets.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
            snippets: BTreeMap::new(),
        }
    }

    /// The built-in library: one template per category, one snippet per feature.
    #[must_use]
    pub fn builtin() -> Self {
        let mut library = Self::empty();
        for category in Category::ALL {
            library = library.with_template(builtin_template(category));
        }
        for feature in Feature::ALL {
            library = library.with_snippet(feature, builtin_snippet(feature));
        }
        library
    }

    /// Add or replace the template for its category.
    #[must_use]
    pub fn with_template(mut self, template: ServiceTemplate) -> Self {
        self.templates.insert(template.category, template);
        self
    }

    /// Remove the template for a category.
    #[must_use]
    pub fn without(mut self, category: Category) -> Self {
        self.templates.remove(&category);
        self
    }

    /// Add or replace the snippet for a feature.
    #[must_use]
    pub fn with_snippet(mut self, feature: Feature, snippet: Snippet) -> Self {
        self.snippets.insert(feature, snippet);
        self
    }

    /// Template for a category, if registered.
    #[must_use]
    pub fn template(&self, category: Category) -> Option<&ServiceTemplate> {
        self.templates.get(&category)
    }

    /// Snippet for a feature, if registered.
    #[must_use]
    pub fn snippet(&self, feature: Feature) -> Option<&Snippet> {
        self.snippets.get(&feature)
    }

    /// List registered templates in category order.
    #[must_use]
    pub fn catalogue(&self) -> Vec<CatalogueEntry> {
        Category::ALL
            .into_iter()
            .filter_map(|category| self.templates.get(&category))
            .map(|template| CatalogueEntry {
                name: template.name.to_string(),
                description: template.description.to_string(),
                category: template.category,
                capabilities: template
                    .capabilities
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            })
            .collect()
    }
}

impl Default for TemplateLibrary {
    fn default() -> Self {
        Self::builtin()
    }
}

const BASE_ROUTES: [&str; 3] = ["/health", "/info", "/analyze"];

fn builtin_template(category: Category) -> ServiceTemplate {
    let (description, source, dependencies, capabilities): (
        &'static str,
        &'static str,
        &'static [&'static str],
        &'static [&'static str],
    ) = match category {
        Category::Database => (
            "Analyses database queries and suggests optimisations",
            include_str!("../templates/database.py"),
            &["sqlparse==0.4.4"],
            &["query analysis", "index suggestions", "slow query detection"],
        ),
        Category::Api => (
            "Monitors API endpoints and response times",
            include_str!("../templates/api.py"),
            &[],
            &["endpoint monitoring", "response time analysis", "error rate tracking"],
        ),
        Category::Logs => (
            "Parses application logs and surfaces error patterns",
            include_str!("../templates/logs.py"),
            &[],
            &["log parsing", "error detection", "pattern matching"],
        ),
        Category::Security => (
            "Scans source code for vulnerabilities and secrets",
            include_str!("../templates/security.py"),
            &[],
            &["vulnerability scanning", "secret detection", "code analysis"],
        ),
        Category::Performance => (
            "Profiles application performance and ranks hotspots",
            include_str!("../templates/performance.py"),
            &["psutil==5.9.8"],
            &["cpu profiling", "memory analysis", "bottleneck detection"],
        ),
        Category::Generic => (
            "Generic customisable analysis service",
            include_str!("../templates/generic.py"),
            &[],
            &["custom analysis", "configurable logic"],
        ),
    };

    ServiceTemplate {
        name: Cow::Borrowed(category.template_name()),
        description: Cow::Borrowed(description),
        category,
        source: Cow::Borrowed(source),
        routes: BASE_ROUTES.iter().map(|r| Cow::Borrowed(*r)).collect(),
        dependencies: dependencies.iter().map(|d| Cow::Borrowed(*d)).collect(),
        capabilities: capabilities.iter().map(|c| Cow::Borrowed(*c)).collect(),
    }
}

fn builtin_snippet(feature: Feature) -> Snippet {
    match feature {
        Feature::Visualization => {
            Snippet::new(include_str!("../templates/snippets/visualization.py")).route("/dashboard")
        }
        Feature::Alerting => Snippet::new(include_str!("../templates/snippets/alerting.py"))
            .route("/alerts")
            .dependency("httpx==0.25.0")
            .env("ALERT_WEBHOOK_URL", "https://hooks.example.com/alerts"),
        Feature::Reporting => {
            Snippet::new(include_str!("../templates/snippets/reporting.py")).route("/report")
        }
        Feature::RealTime => Snippet::new(include_str!("../templates/snippets/real_time.py"))
            .route("/stream")
            .dependency("sse-starlette==1.8.2"),
        Feature::MachineLearning => {
            Snippet::new(include_str!("../templates/snippets/machine_learning.py"))
                .route("/predict")
                .dependency("numpy==1.26.3")
        }
        Feature::Caching => Snippet::new(include_str!("../templates/snippets/caching.py"))
            .route("/cache/stats")
            .dependency("cachetools==5.3.2")
            .env("CACHE_TTL_SECONDS", "300"),
    }
}
