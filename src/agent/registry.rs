use super::{AgentDefinition, AgentError, AgentRef};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info, warn};

#[async_trait]
pub trait AgentRegistry: Send + Sync {
    /// Resolve a reference to a concrete definition
    async fn lookup(&self, reference: &AgentRef) -> Result<AgentDefinition, AgentError>;

    /// Every registered definition
    async fn list(&self) -> Vec<AgentDefinition>;
}

/// Pick the definition a reference names
///
/// Order: exact name and version, latest version of the name, latest
/// definition declaring the name as an alias, then the same three against the
/// reference's template form.
pub fn find_agent<'a>(
    definitions: &'a [AgentDefinition],
    reference: &AgentRef,
) -> Option<&'a AgentDefinition> {
    find_by_name(definitions, &reference.name, reference.version.as_ref()).or_else(|| {
        let alternate = reference.template_form();
        debug!("Agent {} not found, trying {}", reference, alternate);
        find_by_name(definitions, &alternate, reference.version.as_ref())
    })
}

fn find_by_name<'a>(
    definitions: &'a [AgentDefinition],
    name: &str,
    version: Option<&semver::Version>,
) -> Option<&'a AgentDefinition> {
    if let Some(version) = version {
        if let Some(exact) = definitions
            .iter()
            .find(|d| d.name == name && &d.version == version)
        {
            return Some(exact);
        }
    }

    let latest = definitions
        .iter()
        .filter(|d| d.name == name)
        .max_by(|a, b| a.version.cmp(&b.version));
    if let (Some(found), Some(version)) = (latest, version) {
        warn!(
            "Agent {}@{} not registered, using {}@{}",
            name, version, found.name, found.version
        );
    }

    latest.or_else(|| {
        definitions
            .iter()
            .filter(|d| d.aliases.iter().any(|a| a == name))
            .max_by(|a, b| a.version.cmp(&b.version))
    })
}

#[derive(Default)]
pub struct InMemoryAgentRegistry {
    definitions: RwLock<Vec<AgentDefinition>>,
}

impl InMemoryAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_definitions(definitions: Vec<AgentDefinition>) -> Self {
        Self {
            definitions: RwLock::new(definitions),
        }
    }

    pub fn register(&self, definition: AgentDefinition) -> Result<(), AgentError> {
        definition.validate()?;
        if let Ok(mut definitions) = self.definitions.write() {
            definitions.retain(|d| !(d.name == definition.name && d.version == definition.version));
            definitions.push(definition);
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<AgentDefinition> {
        self.definitions
            .read()
            .map(|d| d.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AgentRegistry for InMemoryAgentRegistry {
    async fn lookup(&self, reference: &AgentRef) -> Result<AgentDefinition, AgentError> {
        let definitions = self.snapshot();
        let found = find_agent(&definitions, reference)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(reference.to_string()))?;
        found.validate()?;
        Ok(found)
    }

    async fn list(&self) -> Vec<AgentDefinition> {
        self.snapshot()
    }
}

/// Definitions loaded from a directory of YAML files
///
/// Relative `code_dir` paths are resolved against the file's directory.
pub struct FileAgentRegistry {
    dir: PathBuf,
    inner: InMemoryAgentRegistry,
}

impl FileAgentRegistry {
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, AgentError> {
        let registry = Self {
            dir: dir.into(),
            inner: InMemoryAgentRegistry::new(),
        };
        registry.reload()?;
        Ok(registry)
    }

    /// Re-read every definition file
    pub fn reload(&self) -> Result<usize, AgentError> {
        let definitions = load_dir(&self.dir)?;
        let count = definitions.len();
        if let Ok(mut current) = self.inner.definitions.write() {
            *current = definitions;
        }
        info!("Loaded {} agent definitions from {}", count, self.dir.display());
        Ok(count)
    }
}

fn load_dir(dir: &Path) -> Result<Vec<AgentDefinition>, AgentError> {
    let load_err = |source| AgentError::Load {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(load_err)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    paths.sort();

    let mut definitions = Vec::with_capacity(paths.len());
    for path in paths {
        let text = std::fs::read_to_string(&path).map_err(|source| AgentError::Load {
            path: path.clone(),
            source,
        })?;
        let mut definition: AgentDefinition =
            serde_yaml::from_str(&text).map_err(|e| AgentError::Parse {
                path: path.clone(),
                message: e.to_string(),
            })?;
        if definition.code_dir.is_relative() {
            definition.code_dir = dir.join(&definition.code_dir);
        }
        definition.validate()?;
        definitions.push(definition);
    }
    Ok(definitions)
}

#[async_trait]
impl AgentRegistry for FileAgentRegistry {
    async fn lookup(&self, reference: &AgentRef) -> Result<AgentDefinition, AgentError> {
        self.inner.lookup(reference).await
    }

    async fn list(&self) -> Vec<AgentDefinition> {
        self.inner.list().await
    }
}
