use std::path::Path;

use camino::Utf8Path;
use camino::Utf8PathBuf;
use config::Config;
use config::ConfigError as ExternalConfigError;
use config::File;
use config::FileFormat;
use directories::ProjectDirs;
use serde::Deserialize;
use serde_json::Map;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Profile that queries inside `cache` tags run against.
pub const CACHE_PROFILE_NAME: &str = "qtl.cache";
/// Schema holding cached tables.
pub const CACHE_SCHEMA_NAME: &str = "qtl";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration build/deserialize error")]
    Config(#[from] ExternalConfigError),
    #[error("`template.folder` must be set to load templates from disk")]
    MissingTemplateFolder,
    #[error("Template folder `{0}` is not valid UTF-8")]
    NonUtf8Path(String),
    #[error("Profile `{0}` is declared more than once")]
    DuplicateProfile(String),
    #[error("Profile name `{0}` is reserved")]
    ReservedProfile(String),
}

#[derive(Debug, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub debug: bool,
    pub template: TemplateSettings,
    pub profiles: Vec<Profile>,
    pub parameters: ParameterSettings,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct TemplateSettings {
    pub folder: Option<Utf8PathBuf>,
    /// File extension of template files, without the dot.
    pub extension: String,
}

impl Default for TemplateSettings {
    fn default() -> Self {
        Self {
            folder: None,
            extension: "sql".to_string(),
        }
    }
}

/// A named data source configuration.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Profile {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub connection: Map<String, JsonValue>,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ParameterSettings {
    /// Template variable that request parameters are exposed under.
    pub root: String,
}

impl Default for ParameterSettings {
    fn default() -> Self {
        Self {
            root: "params".to_string(),
        }
    }
}

impl Settings {
    pub fn new(project_root: &Path) -> Result<Self, ConfigError> {
        let user_config_file = ProjectDirs::from("dev", "qtl", "qtl")
            .map(|proj_dirs| proj_dirs.config_dir().join("qtl.toml"));

        Self::load_from_paths(project_root, user_config_file.as_deref())
    }

    fn load_from_paths(
        project_root: &Path,
        user_config_path: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = user_config_path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }

        builder = builder.add_source(
            File::from(project_root.join(".qtl.toml"))
                .format(FileFormat::Toml)
                .required(false),
        );

        builder = builder.add_source(
            File::from(project_root.join("qtl.toml"))
                .format(FileFormat::Toml)
                .required(false),
        );

        let config = builder.build()?;
        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        tracing::debug!(profiles = settings.profiles.len(), "loaded settings");
        Ok(settings)
    }

    /// Rejects duplicate and reserved profile names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = Vec::with_capacity(self.profiles.len());
        for profile in &self.profiles {
            if profile.name == CACHE_PROFILE_NAME {
                return Err(ConfigError::ReservedProfile(profile.name.clone()));
            }
            if seen.contains(&profile.name.as_str()) {
                return Err(ConfigError::DuplicateProfile(profile.name.clone()));
            }
            seen.push(profile.name.as_str());
        }
        Ok(())
    }

    /// The configured template folder, resolved against `project_root` when
    /// relative.
    pub fn template_folder(&self, project_root: &Path) -> Result<Utf8PathBuf, ConfigError> {
        let folder = self
            .template
            .folder
            .as_deref()
            .ok_or(ConfigError::MissingTemplateFolder)?;
        if folder.is_absolute() {
            return Ok(folder.to_path_buf());
        }
        let root = Utf8Path::from_path(project_root)
            .ok_or_else(|| ConfigError::NonUtf8Path(project_root.display().to_string()))?;
        Ok(root.join(folder))
    }

    #[must_use]
    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|profile| profile.name == name)
    }
}
