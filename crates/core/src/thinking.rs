use crate::executor::Format;
use serde_json::{Value, json};
use std::collections::HashMap;

/// Named reasoning effort levels shared across schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Result of parsing a `model(suffix)` reasoning annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSuffix {
    pub base_model: String,
    pub has_suffix: bool,
    pub effort: Option<ReasoningEffort>,
    pub budget: Option<i64>,
}

/// Parse `model(high)` or `model(16384)` into the base model and the
/// requested effort level or token budget. Anything else in the
/// parentheses leaves the model name untouched.
pub fn parse_model_suffix(model: &str) -> ModelSuffix {
    if let Some(open) = model.rfind('(')
        && model.ends_with(')')
        && open > 0
    {
        let inner = &model[open + 1..model.len() - 1];
        if let Some(effort) = ReasoningEffort::parse(inner) {
            return ModelSuffix {
                base_model: model[..open].to_string(),
                has_suffix: true,
                effort: Some(effort),
                budget: None,
            };
        }
        if let Ok(budget) = inner.parse::<i64>()
            && budget >= 0
        {
            return ModelSuffix {
                base_model: model[..open].to_string(),
                has_suffix: true,
                effort: None,
                budget: Some(budget),
            };
        }
    }
    ModelSuffix {
        base_model: model.to_string(),
        has_suffix: false,
        effort: None,
        budget: None,
    }
}

/// Per-provider mapping between effort levels and token budgets.
#[derive(Debug, Clone, Copy)]
pub struct ThinkingProfile {
    /// Budgets for low, medium, high.
    pub level_budgets: [i64; 3],
    pub max_budget: i64,
}

impl ThinkingProfile {
    pub fn budget_for(&self, effort: ReasoningEffort) -> i64 {
        match effort {
            ReasoningEffort::Low => self.level_budgets[0],
            ReasoningEffort::Medium => self.level_budgets[1],
            ReasoningEffort::High => self.level_budgets[2],
        }
    }

    /// Map a budget onto the nearest level at or above it.
    pub fn effort_for(&self, budget: i64) -> ReasoningEffort {
        if budget <= self.level_budgets[0] {
            ReasoningEffort::Low
        } else if budget <= self.level_budgets[1] {
            ReasoningEffort::Medium
        } else {
            ReasoningEffort::High
        }
    }

    pub fn clamp(&self, budget: i64) -> i64 {
        budget.min(self.max_budget)
    }
}

/// Registry of per-provider thinking profiles, populated at startup.
#[derive(Debug, Default)]
pub struct ThinkingRegistry {
    profiles: HashMap<String, ThinkingProfile>,
}

impl ThinkingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: &str, profile: ThinkingProfile) {
        self.profiles.insert(provider.to_string(), profile);
    }

    pub fn profile(&self, provider: &str) -> Option<&ThinkingProfile> {
        self.profiles.get(provider)
    }

    /// The default registry covering the built-in provider family.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        let gemini_like = ThinkingProfile {
            level_budgets: [1024, 8192, 24576],
            max_budget: 32768,
        };
        for provider in ["gemini", "vertex", "antigravity", "gemini-cli"] {
            reg.register(provider, gemini_like);
        }
        let openai_like = ThinkingProfile {
            level_budgets: [1024, 8192, 24576],
            max_budget: 65536,
        };
        for provider in ["codex", "iflow", "kimi"] {
            reg.register(provider, openai_like);
        }
        reg.register(
            "claude",
            ThinkingProfile {
                level_budgets: [1024, 16384, 32768],
                max_budget: 65536,
            },
        );
        reg
    }

    /// Rewrite `payload` so the parsed reasoning suffix takes effect in the
    /// target schema. Idempotent; a provider without a registered profile
    /// leaves the payload unchanged and returns false.
    pub fn apply_thinking(
        &self,
        payload: &mut Value,
        suffix: &ModelSuffix,
        to: Format,
        provider: &str,
    ) -> bool {
        if !suffix.has_suffix || !payload.is_object() {
            return false;
        }
        let Some(profile) = self.profile(provider) else {
            return false;
        };

        let budget = match (suffix.budget, suffix.effort) {
            (Some(b), _) => profile.clamp(b),
            (None, Some(effort)) => profile.budget_for(effort),
            (None, None) => return false,
        };
        let effort = suffix
            .effort
            .unwrap_or_else(|| profile.effort_for(budget));

        match to {
            Format::Gemini | Format::GeminiCli | Format::Antigravity => {
                let root = if payload.get("request").is_some() {
                    &mut payload["request"]
                } else {
                    payload
                };
                if !root.is_object() {
                    return false;
                }
                root["generationConfig"]["thinkingConfig"] = json!({
                    "thinkingBudget": budget,
                    "includeThoughts": true,
                });
            }
            Format::OpenAI => {
                payload["reasoning_effort"] = json!(effort.as_str());
            }
            Format::OpenAIResponses | Format::Codex => {
                payload["reasoning"]["effort"] = json!(effort.as_str());
            }
            Format::Claude => {
                payload["thinking"] = json!({
                    "type": "enabled",
                    "budget_tokens": budget,
                });
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_suffix() {
        let s = parse_model_suffix("gemini-2.5-pro(high)");
        assert_eq!(s.base_model, "gemini-2.5-pro");
        assert!(s.has_suffix);
        assert_eq!(s.effort, Some(ReasoningEffort::High));
        assert_eq!(s.budget, None);
    }

    #[test]
    fn test_parse_budget_suffix() {
        let s = parse_model_suffix("claude-sonnet-4-5(16384)");
        assert_eq!(s.base_model, "claude-sonnet-4-5");
        assert_eq!(s.budget, Some(16384));
        assert_eq!(s.effort, None);
    }

    #[test]
    fn test_parse_no_suffix() {
        let s = parse_model_suffix("gpt-5-codex");
        assert_eq!(s.base_model, "gpt-5-codex");
        assert!(!s.has_suffix);

        // Unknown suffix contents are part of the model name.
        let s = parse_model_suffix("weird-model(fast)");
        assert_eq!(s.base_model, "weird-model(fast)");
        assert!(!s.has_suffix);
    }

    #[test]
    fn test_apply_thinking_gemini() {
        let reg = ThinkingRegistry::with_defaults();
        let suffix = parse_model_suffix("gemini-2.5-pro(high)");
        let mut payload = json!({"contents": []});
        assert!(reg.apply_thinking(&mut payload, &suffix, Format::Gemini, "gemini"));
        assert_eq!(
            payload["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            24576
        );
    }

    #[test]
    fn test_apply_thinking_unknown_provider_unchanged() {
        let reg = ThinkingRegistry::with_defaults();
        let suffix = parse_model_suffix("m(high)");
        let mut payload = json!({"messages": []});
        let before = payload.clone();
        assert!(!reg.apply_thinking(&mut payload, &suffix, Format::OpenAI, "no-such-provider"));
        assert_eq!(payload, before);
    }

    #[test]
    fn test_apply_thinking_idempotent() {
        let reg = ThinkingRegistry::with_defaults();
        let suffix = parse_model_suffix("m(2048)");
        let mut payload = json!({"messages": []});
        reg.apply_thinking(&mut payload, &suffix, Format::Claude, "claude");
        let once = payload.clone();
        reg.apply_thinking(&mut payload, &suffix, Format::Claude, "claude");
        assert_eq!(payload, once);
        assert_eq!(payload["thinking"]["budget_tokens"], 2048);
    }

    #[test]
    fn test_budget_to_effort_mapping() {
        let reg = ThinkingRegistry::with_defaults();
        let suffix = parse_model_suffix("gpt-5(32768)");
        let mut payload = json!({});
        reg.apply_thinking(&mut payload, &suffix, Format::Codex, "codex");
        assert_eq!(payload["reasoning"]["effort"], "high");
    }
}
