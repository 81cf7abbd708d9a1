use std::collections::HashMap;

use crate::backends::Capability;
use crate::error::AppError;

/// Ids of the built-in prompts.
pub const CONSOLIDATION_CLASSIFY: &str = "consolidation-classify";
pub const CONSOLIDATION_CLASSIFY_L2: &str = "consolidation-classify-l2";
pub const QNTM_GENERATE: &str = "qntm-generate";
pub const QUERY_EXPANSION: &str = "query-expansion";

/// Which backends a variant targets. More specific targets win over `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    /// Universal; required to exist for every prompt id.
    Any,
    Provider(String),
    ProviderModel(String, String),
}

impl TargetSpec {
    fn specificity(&self) -> i32 {
        match self {
            Self::Any => 0,
            Self::Provider(_) => 1,
            Self::ProviderModel(_, _) => 2,
        }
    }

    fn matches(&self, provider: &str, model_family: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Provider(p) => p == provider,
            Self::ProviderModel(p, m) => p == provider && m == model_family,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromptVariant {
    pub target: TargetSpec,
    pub priority: i32,
    pub required_capabilities: Vec<Capability>,
    pub template: String,
}

/// Selection context: who is going to run the rendered prompt.
#[derive(Debug, Clone, Default)]
pub struct RenderTarget {
    pub provider: String,
    pub model_family: String,
    pub capabilities: Vec<Capability>,
}

/// Template store. Variants are scored by (capability matches, target
/// specificity, priority); placeholders are `{{name}}` and every placeholder
/// must be supplied. An unsubstituted one is a fatal error.
#[derive(Default)]
pub struct PromptRegistry {
    variants: HashMap<String, Vec<PromptVariant>>,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the prompts the pipeline and the consolidation
    /// engine need.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        register_default_prompts(&mut registry);
        registry
    }

    pub fn clear(&mut self) {
        self.variants.clear();
    }

    pub fn register(&mut self, id: &str, variant: PromptVariant) {
        self.variants.entry(id.to_string()).or_default().push(variant);
    }

    /// Every id must carry a universal variant; call after registration.
    pub fn validate(&self) -> Result<(), AppError> {
        for (id, variants) in &self.variants {
            if !variants.iter().any(|v| v.target == TargetSpec::Any) {
                return Err(AppError::Template(format!(
                    "prompt {id} has no universal (*) variant"
                )));
            }
        }
        Ok(())
    }

    fn select<'a>(
        &'a self,
        id: &str,
        target: &RenderTarget,
    ) -> Result<&'a PromptVariant, AppError> {
        let variants = self
            .variants
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("prompt {id}")))?;

        variants
            .iter()
            .filter(|v| v.target.matches(&target.provider, &target.model_family))
            .max_by_key(|v| {
                let capability_matches = v
                    .required_capabilities
                    .iter()
                    .filter(|c| target.capabilities.contains(c))
                    .count() as i32;
                (capability_matches, v.target.specificity(), v.priority)
            })
            .ok_or_else(|| AppError::Template(format!("prompt {id} has no matching variant")))
    }

    /// Pick the best variant for `target` and substitute `vars`.
    pub fn render(
        &self,
        id: &str,
        target: &RenderTarget,
        vars: &HashMap<&str, String>,
    ) -> Result<String, AppError> {
        let variant = self.select(id, target)?;
        let mut rendered = variant.template.clone();

        for (name, value) in vars {
            rendered = rendered.replace(&format!("{{{{{name}}}}}"), value);
        }

        if let Some(start) = rendered.find("{{") {
            let tail: String = rendered
                .get(start..)
                .unwrap_or_default()
                .chars()
                .take(40)
                .collect();
            return Err(AppError::Template(format!(
                "prompt {id} has unsubstituted placeholder near: {tail}"
            )));
        }

        Ok(rendered)
    }
}

fn universal(template: &str) -> PromptVariant {
    PromptVariant {
        target: TargetSpec::Any,
        priority: 0,
        required_capabilities: Vec::new(),
        template: template.to_string(),
    }
}

fn register_default_prompts(registry: &mut PromptRegistry) {
    registry.register(
        QNTM_GENERATE,
        universal(
            "Generate between one and five short semantic key strings for the text below. \
Keys are lowercase, dot-separated tag paths such as `auth.session.refresh`. \
Reuse keys from the existing vocabulary whenever one fits; invent a new key only \
when nothing applies.\n\nExisting keys:\n{{existing_keys}}\n\nContext: file \
{{file_name}}, chunk {{chunk_index}} of {{total_chunks}}.\n\nText:\n{{text}}",
        ),
    );

    registry.register(
        QUERY_EXPANSION,
        universal(
            "Produce two to four alternative phrasings of the search query below. \
Keep each phrasing short and self-contained; vary vocabulary, not meaning.\n\n\
Query: {{query}}",
        ),
    );

    registry.register(
        CONSOLIDATION_CLASSIFY,
        universal(
            "Two stored memory chunks appear to describe the same or adjacent work. \
Classify their relationship.\n\n\
- duplicate_work: both capture the same fact or artifact; one can absorb the other.\n\
- sequential_iteration: one is a later state of the same effort; direction says which way time flows.\n\
- contextual_convergence: different angles on one topic that deserve a merged synthesis.\n\n\
Chunk A (created {{first_created}}, keys: {{first_keys}}):\n{{first_text}}\n\n\
Chunk B (created {{second_created}}, keys: {{second_keys}}):\n{{second_text}}",
        ),
    );

    registry.register(
        CONSOLIDATION_CLASSIFY_L2,
        universal(
            "Two consolidated memory summaries may belong to one broader topic. \
Decide whether they should be merged into a higher-level abstraction. Use \
contextual_convergence only when a genuinely more abstract summary exists; \
prefer duplicate_work when they restate each other.\n\n\
Summary A (level {{first_level}}, keys: {{first_keys}}):\n{{first_text}}\n\n\
Summary B (level {{second_level}}, keys: {{second_keys}}):\n{{second_text}}",
        ),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&'static str, &str)]) -> HashMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn defaults_validate() {
        let registry = PromptRegistry::with_defaults();
        registry.validate().expect("every id has a * variant");
    }

    #[test]
    fn render_substitutes_all_placeholders() {
        let registry = PromptRegistry::with_defaults();
        let rendered = registry
            .render(
                QUERY_EXPANSION,
                &RenderTarget::default(),
                &vars(&[("query", "authentication")]),
            )
            .expect("render");
        assert!(rendered.contains("authentication"));
        assert!(!rendered.contains("{{"));
    }

    #[test]
    fn missing_placeholder_is_fatal() {
        let registry = PromptRegistry::with_defaults();
        let err = registry
            .render(QUERY_EXPANSION, &RenderTarget::default(), &HashMap::new())
            .err()
            .expect("must fail");
        assert!(matches!(err, AppError::Template(_)));
    }

    #[test]
    fn specific_variant_beats_universal() {
        let mut registry = PromptRegistry::new();
        registry.register("greet", universal("hello {{name}}"));
        registry.register(
            "greet",
            PromptVariant {
                target: TargetSpec::Provider("ollama".into()),
                priority: 0,
                required_capabilities: Vec::new(),
                template: "tjena {{name}}".into(),
            },
        );

        let target = RenderTarget {
            provider: "ollama".into(),
            model_family: "llama3".into(),
            capabilities: Vec::new(),
        };
        let rendered = registry
            .render("greet", &target, &vars(&[("name", "world")]))
            .expect("render");
        assert_eq!(rendered, "tjena world");

        let generic = registry
            .render("greet", &RenderTarget::default(), &vars(&[("name", "world")]))
            .expect("render generic");
        assert_eq!(generic, "hello world");
    }

    #[test]
    fn capability_matches_outrank_specificity() {
        let mut registry = PromptRegistry::new();
        registry.register("think", universal("plain {{x}}"));
        registry.register(
            "think",
            PromptVariant {
                target: TargetSpec::Any,
                priority: -1,
                required_capabilities: vec![Capability::ExtendedThinking],
                template: "deep {{x}}".into(),
            },
        );

        let thinking_target = RenderTarget {
            provider: "openai".into(),
            model_family: "o3".into(),
            capabilities: vec![Capability::ExtendedThinking],
        };
        let rendered = registry
            .render("think", &thinking_target, &vars(&[("x", "q")]))
            .expect("render");
        assert_eq!(rendered, "deep q");
    }

    #[test]
    fn validate_flags_missing_universal_variant() {
        let mut registry = PromptRegistry::new();
        registry.register(
            "partial",
            PromptVariant {
                target: TargetSpec::Provider("openai".into()),
                priority: 0,
                required_capabilities: Vec::new(),
                template: "only openai".into(),
            },
        );
        assert!(registry.validate().is_err());
    }
}
