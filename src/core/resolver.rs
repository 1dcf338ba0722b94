use crate::llm::{ProviderDescriptor, Vendor};
use crate::storage::{Project, PromptTemplate, ProviderEntity, Storage};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("project {0} not found")]
    ProjectNotFound(i64),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Where a descriptor came from.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedProvider {
    Linked {
        provider_id: i64,
        descriptor: ProviderDescriptor,
    },
    SynthesizedFromProject {
        project_id: i64,
        descriptor: ProviderDescriptor,
    },
}

impl ResolvedProvider {
    pub fn descriptor(&self) -> &ProviderDescriptor {
        match self {
            Self::Linked { descriptor, .. } | Self::SynthesizedFromProject { descriptor, .. } => {
                descriptor
            }
        }
    }

    /// Stored provider id, absent for synthesized descriptors.
    pub fn provider_id(&self) -> Option<i64> {
        match self {
            Self::Linked { provider_id, .. } => Some(*provider_id),
            Self::SynthesizedFromProject { .. } => None,
        }
    }
}

impl From<&ProviderEntity> for ProviderDescriptor {
    fn from(entity: &ProviderEntity) -> Self {
        Self {
            source: Vendor::from(entity.source.clone()),
            endpoint: entity.endpoint.clone(),
            api_key: entity.api_key.clone(),
            default_model: entity.default_model.clone(),
            temperature: entity.temperature,
            top_p: entity.top_p,
            max_tokens: entity.max_tokens,
            headers: entity.headers.clone(),
            config: entity.config.clone(),
        }
    }
}

/// Build a descriptor from a project's inline provider fields. A Gemini
/// credential wins over the OpenAI-compatible settings.
pub fn synthesize(project: &Project) -> ProviderDescriptor {
    let legacy = &project.legacy;
    let (source, endpoint, api_key, model) = if !legacy.gemini_api_key.is_empty() {
        (
            Vendor::Gemini,
            String::new(),
            legacy.gemini_api_key.clone(),
            legacy.gemini_model.clone(),
        )
    } else {
        (
            Vendor::OpenAiCompatible,
            legacy.openai_base_url.clone(),
            legacy.openai_api_key.clone(),
            legacy.openai_model.clone(),
        )
    };

    ProviderDescriptor {
        source,
        endpoint,
        api_key,
        default_model: model,
        temperature: legacy.temperature,
        top_p: legacy.top_p,
        max_tokens: legacy.max_tokens,
        headers: Default::default(),
        config: None,
    }
}

/// Decides which backend serves a prompt: the prompt's own provider, then
/// the project's, then the project's inline fields.
#[derive(Clone)]
pub struct ProviderResolver<S: Storage> {
    storage: S,
}

impl<S: Storage> ProviderResolver<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub async fn resolve(&self, prompt: &PromptTemplate) -> Result<ResolvedProvider, ResolveError> {
        let project = self
            .storage
            .get_project(prompt.project_id)
            .await?
            .ok_or(ResolveError::ProjectNotFound(prompt.project_id))?;

        for provider_id in [prompt.provider_id, project.provider_id].into_iter().flatten() {
            match self.storage.get_provider(provider_id).await? {
                Some(entity) => {
                    return Ok(ResolvedProvider::Linked {
                        provider_id,
                        descriptor: ProviderDescriptor::from(&entity),
                    })
                }
                None => tracing::warn!(
                    prompt_id = prompt.id,
                    provider_id,
                    "Linked provider no longer exists, falling through"
                ),
            }
        }

        Ok(ResolvedProvider::SynthesizedFromProject {
            project_id: project.id,
            descriptor: synthesize(&project),
        })
    }
}
