use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use camino::Utf8Component;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use dashmap::DashMap;
use indexmap::IndexMap;
use qtl_conf::Settings;
use qtl_query::DataResult;
use qtl_query::Headers;
use qtl_query::Pagination;
use qtl_query::QueryBuilder;
use qtl_query::QueryExecutor;
use qtl_templates::Node;
use rayon::prelude::*;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value as JsonValue;
use tracing::instrument;
use walkdir::WalkDir;

use crate::builtins::register_builtins;
use crate::builtins::FINAL_BUILDER_NAME;
use crate::context::Context;
use crate::context::ExecutionMetadata;
use crate::environment::BuildTimeEnvironment;
use crate::environment::CompiledTemplate;
use crate::environment::RuntimeEnvironment;
use crate::error::EngineError;
use crate::extensions::ExtensionRegistry;
use crate::validators::ValidatorLoader;
use crate::value::Value;

/// A template source and the name it is rendered by.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Template {
    pub name: String,
    pub statement: String,
}

pub trait TemplateProvider: Send + Sync {
    fn templates(&self) -> Result<Vec<Template>, EngineError>;

    fn template(&self, name: &str) -> Result<Template, EngineError> {
        self.templates()?
            .into_iter()
            .find(|template| template.name == name)
            .ok_or_else(|| EngineError::TemplateNotFound(name.to_string()))
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryTemplateProvider {
    templates: IndexMap<String, String>,
}

impl InMemoryTemplateProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_template(mut self, name: impl Into<String>, statement: impl Into<String>) -> Self {
        self.insert(name, statement);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, statement: impl Into<String>) {
        self.templates.insert(name.into(), statement.into());
    }
}

impl TemplateProvider for InMemoryTemplateProvider {
    fn templates(&self) -> Result<Vec<Template>, EngineError> {
        Ok(self
            .templates
            .iter()
            .map(|(name, statement)| Template {
                name: name.clone(),
                statement: statement.clone(),
            })
            .collect())
    }

    fn template(&self, name: &str) -> Result<Template, EngineError> {
        self.templates
            .get(name)
            .map(|statement| Template {
                name: name.to_string(),
                statement: statement.clone(),
            })
            .ok_or_else(|| EngineError::TemplateNotFound(name.to_string()))
    }
}

/// Reads templates from a folder tree. A template's name is its path
/// relative to the folder, without the extension and with `/` separators.
#[derive(Clone, Debug)]
pub struct FileTemplateProvider {
    folder: Utf8PathBuf,
    extension: String,
}

impl FileTemplateProvider {
    pub fn new(folder: impl Into<Utf8PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            extension: extension.into(),
        }
    }

    pub fn from_settings(settings: &Settings, project_root: &Path) -> Result<Self, EngineError> {
        let folder = settings.template_folder(project_root)?;
        Ok(Self::new(folder, settings.template.extension.clone()))
    }

    fn template_name(&self, path: &Utf8Path) -> Option<String> {
        if path.extension() != Some(self.extension.as_str()) {
            return None;
        }
        let relative = path.strip_prefix(&self.folder).ok()?.with_extension("");
        Some(relative.components().map(|part| part.as_str()).collect::<Vec<_>>().join("/"))
    }

    /// File path for a template name. Names that would leave the folder
    /// resolve to nothing.
    fn template_path(&self, name: &str) -> Option<Utf8PathBuf> {
        if name.is_empty() || name.split('/').any(str::is_empty) {
            return None;
        }
        let relative = Utf8Path::new(name);
        if !relative
            .components()
            .all(|part| matches!(part, Utf8Component::Normal(_)))
        {
            return None;
        }
        Some(self.folder.join(format!("{name}.{}", self.extension)))
    }
}

impl TemplateProvider for FileTemplateProvider {
    fn templates(&self) -> Result<Vec<Template>, EngineError> {
        let mut templates = Vec::new();
        for entry in WalkDir::new(&self.folder).sort_by_file_name() {
            let entry = entry.map_err(|err| EngineError::Configuration(err.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(path) = Utf8Path::from_path(entry.path()) else {
                tracing::warn!(path = %entry.path().display(), "skipping template with a non UTF-8 path");
                continue;
            };
            let Some(name) = self.template_name(path) else {
                continue;
            };
            let statement = fs::read_to_string(path)
                .map_err(|err| EngineError::Configuration(format!("Failed to read {path}: {err}")))?;
            templates.push(Template { name, statement });
        }
        Ok(templates)
    }

    fn template(&self, name: &str) -> Result<Template, EngineError> {
        let Some(path) = self.template_path(name) else {
            return Err(EngineError::TemplateNotFound(name.to_string()));
        };
        match fs::read_to_string(&path) {
            Ok(statement) => Ok(Template {
                name: name.to_string(),
                statement,
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(EngineError::TemplateNotFound(name.to_string()))
            }
            Err(err) => Err(EngineError::Configuration(format!(
                "Failed to read {path}: {err}"
            ))),
        }
    }
}

/// Every compiled template and its metadata, keyed by template name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompiledArtifact {
    pub templates: IndexMap<String, Node>,
    pub metadata: IndexMap<String, IndexMap<String, JsonValue>>,
}

#[derive(Clone, Debug, Default)]
pub struct RenderOptions {
    /// Request parameters, exposed to templates under the parameter root.
    pub parameters: Map<String, JsonValue>,
    pub profile_name: Option<String>,
    pub headers: Headers,
}

/// Compiles templates from a provider and renders them into query builders.
///
/// Compiled templates are cached by name for the lifetime of the engine. A
/// template missing from the cache is compiled on first render.
pub struct TemplateEngine {
    provider: Arc<dyn TemplateProvider>,
    build_time: BuildTimeEnvironment,
    runtime: RuntimeEnvironment,
    parameter_root: String,
    compiled: DashMap<String, Arc<CompiledTemplate>>,
}

impl TemplateEngine {
    pub fn new(
        registry: &ExtensionRegistry,
        provider: Arc<dyn TemplateProvider>,
        parameter_root: impl Into<String>,
    ) -> Self {
        let parameter_root = parameter_root.into();
        Self {
            provider,
            build_time: BuildTimeEnvironment::new(registry, parameter_root.clone()),
            runtime: RuntimeEnvironment::new(registry),
            parameter_root,
            compiled: DashMap::new(),
        }
    }

    /// An engine with the built-in tags, filters and validators.
    pub fn with_builtins(
        executor: Arc<QueryExecutor>,
        provider: Arc<dyn TemplateProvider>,
        settings: &Settings,
    ) -> Result<Self, EngineError> {
        let mut registry = ExtensionRegistry::new();
        register_builtins(&mut registry, &executor, &ValidatorLoader::with_builtins())?;
        Ok(Self::new(&registry, provider, settings.parameters.root.clone()))
    }

    /// Compiles every template the provider yields, in parallel, and caches
    /// the results.
    #[instrument(skip(self))]
    pub fn compile(&self) -> Result<CompiledArtifact, EngineError> {
        let templates = self.provider.templates()?;
        let compiled = templates
            .par_iter()
            .map(|template| {
                self.build_time
                    .compile(&template.statement)
                    .map(|compiled| (template.name.clone(), compiled))
                    .inspect_err(|err| {
                        tracing::warn!(template = %template.name, %err, "failed to compile template");
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut artifact = CompiledArtifact::default();
        for (name, template) in compiled {
            artifact.templates.insert(name.clone(), template.root.clone());
            artifact.metadata.insert(name.clone(), template.metadata.clone());
            self.compiled.insert(name, Arc::new(template));
        }
        tracing::info!(templates = artifact.templates.len(), "compiled templates");
        Ok(artifact)
    }

    /// Caches the templates of a previously compiled artifact.
    pub fn load(&self, artifact: CompiledArtifact) {
        let CompiledArtifact {
            templates,
            mut metadata,
        } = artifact;
        for (name, root) in templates {
            let metadata = metadata.shift_remove(&name).unwrap_or_default();
            self.compiled
                .insert(name, Arc::new(CompiledTemplate { root, metadata }));
        }
    }

    /// Metadata of the named template, compiling it when needed.
    pub fn metadata(&self, name: &str) -> Result<IndexMap<String, JsonValue>, EngineError> {
        Ok(self.compiled_template(name)?.metadata.clone())
    }

    fn compiled_template(&self, name: &str) -> Result<Arc<CompiledTemplate>, EngineError> {
        if let Some(compiled) = self.compiled.get(name) {
            return Ok(Arc::clone(compiled.value()));
        }

        let template = self.provider.template(name)?;
        let compiled = Arc::new(self.build_time.compile(&template.statement)?);
        tracing::debug!(template = name, "compiled template on demand");
        Ok(Arc::clone(
            self.compiled
                .entry(name.to_string())
                .or_insert(compiled)
                .value(),
        ))
    }

    /// Renders the named template and returns its main builder without
    /// executing it.
    #[instrument(skip(self, options))]
    pub async fn render_builder(
        &self,
        name: &str,
        options: RenderOptions,
    ) -> Result<Arc<QueryBuilder>, EngineError> {
        let result = self.render_main_builder(name, options).await;
        if let Err(err) = &result {
            err.log_internal();
        }
        result
    }

    /// Renders the named template and executes its main builder.
    pub async fn render(
        &self,
        name: &str,
        options: RenderOptions,
        pagination: Option<Pagination>,
    ) -> Result<DataResult, EngineError> {
        let builder = self.render_builder(name, options).await?;
        if let Some(pagination) = pagination {
            builder.paginate(pagination);
        }
        Ok(builder.value().await?)
    }

    async fn render_main_builder(
        &self,
        name: &str,
        options: RenderOptions,
    ) -> Result<Arc<QueryBuilder>, EngineError> {
        let template = self.compiled_template(name)?;
        let mut context = Context::new(ExecutionMetadata {
            profile_name: options.profile_name,
            headers: options.headers,
        });
        context.set_variable(
            self.parameter_root.clone(),
            Value::from(JsonValue::Object(options.parameters)),
        );

        self.runtime.render(&template.root, &mut context).await?;

        match context.exports().get(FINAL_BUILDER_NAME) {
            Some(Value::Builder(builder)) => Ok(Arc::clone(builder)),
            _ => Err(EngineError::internal(format!(
                "Template `{name}` did not produce a main builder"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn test_in_memory_provider_reports_missing_template() {
        let provider = InMemoryTemplateProvider::new().with_template("a", "select 1");
        assert_eq!(provider.template("a").unwrap().statement, "select 1");
        assert!(matches!(
            provider.template("b"),
            Err(EngineError::TemplateNotFound(name)) if name == "b"
        ));
    }

    #[test]
    fn test_file_provider_names_templates_by_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("users")).unwrap();
        fs::write(root.join("users/by_id.sql"), "select 1").unwrap();
        fs::write(root.join("top.sql"), "select 2").unwrap();
        fs::write(root.join("notes.txt"), "ignored").unwrap();

        let provider = FileTemplateProvider::new(root, "sql");
        let names: Vec<_> = provider
            .templates()
            .unwrap()
            .into_iter()
            .map(|template| template.name)
            .collect();
        assert_eq!(names, vec!["top", "users/by_id"]);
        assert_eq!(provider.template("users/by_id").unwrap().statement, "select 1");
        assert!(matches!(
            provider.template("missing"),
            Err(EngineError::TemplateNotFound(_))
        ));
    }

    #[test]
    fn test_file_provider_stays_inside_its_folder() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("sql/users")).unwrap();
        fs::write(root.join("secret.sql"), "select 'outside'").unwrap();
        fs::write(root.join("sql/users/by_id.sql"), "select 1").unwrap();

        let provider = FileTemplateProvider::new(root.join("sql"), "sql");
        let absolute = root.join("secret");
        for name in [
            "../secret",
            "users/../../secret",
            "/secret",
            absolute.as_str(),
            "users//by_id",
            "./users/by_id",
            "",
        ] {
            assert!(
                matches!(provider.template(name), Err(EngineError::TemplateNotFound(_))),
                "{name} should not resolve"
            );
        }
        assert_eq!(provider.template("users/by_id").unwrap().statement, "select 1");
    }

    #[test]
    fn test_file_provider_from_settings_requires_folder() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileTemplateProvider::from_settings(&Settings::default(), dir.path()).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }
}
