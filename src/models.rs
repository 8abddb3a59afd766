//! Routing of requested model names onto Gemini models.
//!
//! Clients ask for Claude model names. Each name resolves to one of two tiers
//! and from there to the configured Gemini target. Names that already denote a
//! Gemini model are forwarded unchanged.

use crate::config::ModelsConfig;
use serde::Serialize;
use std::collections::HashMap;

const GEMINI_PREFIX: &str = "gemini-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Big,
    Small,
}

/// Where a requested model ends up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub tier: Tier,
    pub target: String,
}

/// Entry in the `/v1/models` listing.
#[derive(Debug, Clone, Serialize)]
pub struct ModelListing {
    pub id: String,
    pub tier: Tier,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct ModelRouter {
    big: String,
    small: String,
    small_markers: Vec<String>,
    aliases: HashMap<String, String>,
}

impl ModelRouter {
    pub fn new(models: &ModelsConfig) -> Self {
        Self {
            big: models.big.clone(),
            small: models.small.clone(),
            small_markers: models
                .small_markers
                .iter()
                .map(|m| m.to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
            aliases: models
                .aliases
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.clone()))
                .collect(),
        }
    }

    /// Resolve a requested model. Never fails: anything unrecognised goes to the big tier.
    ///
    /// Order: exact alias, Gemini passthrough, small-tier marker, big tier.
    pub fn resolve(&self, requested: &str) -> Route {
        let lowered = requested.trim().to_lowercase();

        if let Some(target) = self.aliases.get(&lowered) {
            return Route {
                tier: self.tier_of(target),
                target: target.clone(),
            };
        }

        let bare = lowered.strip_prefix("models/").unwrap_or(&lowered);
        if bare.starts_with(GEMINI_PREFIX) {
            return Route {
                tier: self.tier_of(bare),
                target: bare.to_string(),
            };
        }

        if self.has_small_marker(&lowered) {
            Route {
                tier: Tier::Small,
                target: self.small.clone(),
            }
        } else {
            Route {
                tier: Tier::Big,
                target: self.big.clone(),
            }
        }
    }

    pub fn target_for(&self, tier: Tier) -> &str {
        match tier {
            Tier::Big => &self.big,
            Tier::Small => &self.small,
        }
    }

    fn has_small_marker(&self, lowered: &str) -> bool {
        self.small_markers.iter().any(|m| lowered.contains(m.as_str()))
    }

    fn tier_of(&self, target: &str) -> Tier {
        let lowered = target.to_lowercase();
        if lowered == self.small.to_lowercase() || self.has_small_marker(&lowered) {
            Tier::Small
        } else {
            Tier::Big
        }
    }

    /// Known Claude names with the Gemini model each one resolves to.
    pub fn listing(&self) -> Vec<ModelListing> {
        let mut ids: Vec<String> = known_claude_models()
            .into_iter()
            .map(str::to_string)
            .collect();
        for alias in self.aliases.keys() {
            if !ids.contains(alias) {
                ids.push(alias.clone());
            }
        }

        ids.into_iter()
            .map(|id| {
                let route = self.resolve(&id);
                ModelListing {
                    id,
                    tier: route.tier,
                    target: route.target,
                }
            })
            .collect()
    }
}

/// Claude model names clients commonly send.
#[must_use]
pub fn known_claude_models() -> Vec<&'static str> {
    vec![
        "claude-opus-4-1-20250805",
        "claude-opus-4-20250514",
        "claude-sonnet-4-5-20250929",
        "claude-sonnet-4-20250514",
        "claude-3-7-sonnet-20250219",
        "claude-3-5-sonnet-20241022",
        "claude-3-5-haiku-20241022",
        "claude-haiku-4-5-20251001",
        "claude-3-haiku-20240307",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> ModelRouter {
        ModelRouter::new(&ModelsConfig::default())
    }

    #[test]
    fn test_haiku_routes_to_small() {
        let route = router().resolve("claude-3-5-haiku-20241022");
        assert_eq!(route.tier, Tier::Small);
        assert_eq!(route.target, "gemini-2.5-flash");
    }

    #[test]
    fn test_case_insensitive_marker() {
        assert_eq!(router().resolve("Claude-HAIKU-4-5").tier, Tier::Small);
    }

    #[test]
    fn test_sonnet_and_opus_route_to_big() {
        let r = router();
        assert_eq!(r.resolve("claude-sonnet-4-20250514").target, "gemini-2.5-pro");
        assert_eq!(r.resolve("claude-opus-4-20250514").tier, Tier::Big);
    }

    #[test]
    fn test_unknown_falls_back_to_big() {
        let route = router().resolve("gpt-4o");
        assert_eq!(route.tier, Tier::Big);
        assert_eq!(route.target, "gemini-2.5-pro");
        assert_eq!(router().resolve("").tier, Tier::Big);
    }

    #[test]
    fn test_gemini_names_pass_through() {
        let r = router();
        let route = r.resolve("gemini-2.0-flash-lite");
        assert_eq!(route.target, "gemini-2.0-flash-lite");
        assert_eq!(route.tier, Tier::Small);

        let route = r.resolve("models/gemini-2.5-pro");
        assert_eq!(route.target, "gemini-2.5-pro");
        assert_eq!(route.tier, Tier::Big);
    }

    #[test]
    fn test_alias_wins_over_markers() {
        let mut models = ModelsConfig::default();
        models
            .aliases
            .insert("claude-3-haiku-20240307".to_string(), "gemini-2.5-pro".to_string());
        let r = ModelRouter::new(&models);

        let route = r.resolve("claude-3-haiku-20240307");
        assert_eq!(route.target, "gemini-2.5-pro");
        assert_eq!(route.tier, Tier::Big);
    }

    #[test]
    fn test_listing_covers_known_models() {
        let listing = router().listing();
        assert_eq!(listing.len(), known_claude_models().len());
        assert!(listing
            .iter()
            .any(|m| m.id == "claude-3-5-haiku-20241022" && m.tier == Tier::Small));
    }
}
