use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rand::Rng;

use modelgate_storage::entities::providers;

#[derive(Debug, Clone)]
pub struct Provider {
    pub id: i64,
    pub name: String,
    pub provider_type: String,
    pub enabled: bool,
    pub priority: i32,
    pub weight: i32,
    pub models: Vec<String>,
    pub model_mapping: HashMap<String, String>,
    pub base_url: Option<String>,
    pub group: String,
}

impl Provider {
    pub fn from_model(model: &providers::Model) -> Self {
        let models: Vec<String> = serde_json::from_str(&model.models).unwrap_or_default();
        let model_mapping: HashMap<String, String> =
            serde_json::from_str(&model.model_mapping).unwrap_or_default();
        Self {
            id: model.id,
            name: model.name.clone(),
            provider_type: model.provider_type.clone(),
            enabled: model.enabled,
            priority: model.priority,
            weight: model.weight.max(1),
            models,
            model_mapping,
            base_url: model.base_url.clone(),
            group: model.group_name.clone(),
        }
    }

    pub fn supports(&self, canonical_model: &str) -> bool {
        self.models.iter().any(|model| model == canonical_model)
    }

    /// Canonical name -> the name this provider's upstream expects.
    pub fn upstream_model<'a>(&'a self, canonical_model: &'a str) -> &'a str {
        self.model_mapping
            .get(canonical_model)
            .map(String::as_str)
            .unwrap_or(canonical_model)
    }
}

/// Published provider snapshot; readers take it once per request.
pub struct ProviderRegistry {
    snapshot: ArcSwap<Vec<Arc<Provider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn replace_all(&self, models: &[providers::Model]) {
        let providers: Vec<Arc<Provider>> = models
            .iter()
            .map(|model| Arc::new(Provider::from_model(model)))
            .collect();
        self.snapshot.store(Arc::new(providers));
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<Provider>>> {
        self.snapshot.load_full()
    }

    pub fn get(&self, provider_id: i64) -> Option<Arc<Provider>> {
        self.snapshot
            .load()
            .iter()
            .find(|provider| provider.id == provider_id)
            .cloned()
    }

    /// Candidate providers for a canonical model: the token's group first,
    /// each side ordered by priority (desc) with a weight-biased shuffle
    /// inside every priority tier. Other groups are appended only when
    /// cross-group retry is allowed.
    pub fn resolve(
        &self,
        canonical_model: &str,
        group: &str,
        cross_group: bool,
    ) -> Vec<Arc<Provider>> {
        let snapshot = self.snapshot.load();
        let mut in_group = Vec::new();
        let mut out_group = Vec::new();
        for provider in snapshot.iter() {
            if !provider.enabled || !provider.supports(canonical_model) {
                continue;
            }
            if provider.group == group {
                in_group.push(provider.clone());
            } else {
                out_group.push(provider.clone());
            }
        }
        let mut ordered = order_by_priority(in_group);
        if cross_group {
            ordered.extend(order_by_priority(out_group));
        }
        ordered
    }

    /// Union of canonical models across enabled providers, optionally
    /// intersected with a token whitelist. Sorted for stable listings.
    pub fn all_models(&self, whitelist: &[String]) -> Vec<String> {
        let snapshot = self.snapshot.load();
        let mut models: Vec<String> = snapshot
            .iter()
            .filter(|provider| provider.enabled)
            .flat_map(|provider| provider.models.iter().cloned())
            .collect();
        models.sort_unstable();
        models.dedup();
        if !whitelist.is_empty() {
            models.retain(|model| whitelist.iter().any(|allowed| allowed == model));
        }
        models
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn order_by_priority(mut providers: Vec<Arc<Provider>>) -> Vec<Arc<Provider>> {
    providers.sort_by(|a, b| b.priority.cmp(&a.priority));
    let mut ordered = Vec::with_capacity(providers.len());
    let mut index = 0;
    while index < providers.len() {
        let mut end = index + 1;
        while end < providers.len() && providers[end].priority == providers[index].priority {
            end += 1;
        }
        let mut tier: Vec<Arc<Provider>> = providers[index..end].to_vec();
        weighted_shuffle(&mut tier);
        ordered.extend(tier);
        index = end;
    }
    ordered
}

fn weighted_shuffle(tier: &mut Vec<Arc<Provider>>) {
    if tier.len() < 2 {
        return;
    }
    let mut rng = rand::thread_rng();
    let mut shuffled = Vec::with_capacity(tier.len());
    while !tier.is_empty() {
        let total: i64 = tier.iter().map(|provider| provider.weight as i64).sum();
        let mut roll = rng.gen_range(0..total);
        let mut chosen = tier.len() - 1;
        for (position, provider) in tier.iter().enumerate() {
            roll -= provider.weight as i64;
            if roll < 0 {
                chosen = position;
                break;
            }
        }
        shuffled.push(tier.remove(chosen));
    }
    *tier = shuffled;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_model(
        id: i64,
        priority: i32,
        weight: i32,
        models: &[&str],
        group: &str,
    ) -> providers::Model {
        providers::Model {
            id,
            name: format!("p{id}"),
            provider_type: "openai".to_string(),
            enabled: true,
            priority,
            weight,
            models: serde_json::to_string(models).unwrap(),
            model_mapping: "{}".to_string(),
            base_url: None,
            group_name: group.to_string(),
            created_at: 0,
        }
    }

    #[test]
    fn resolve_orders_by_priority_desc() {
        let registry = ProviderRegistry::new();
        registry.replace_all(&[
            provider_model(1, 1, 1, &["gpt-4o-mini"], "default"),
            provider_model(2, 9, 1, &["gpt-4o-mini"], "default"),
            provider_model(3, 5, 1, &["gpt-4o-mini"], "default"),
        ]);
        let resolved = registry.resolve("gpt-4o-mini", "default", false);
        let ids: Vec<i64> = resolved.iter().map(|provider| provider.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn resolve_excludes_unsupported_and_other_groups() {
        let registry = ProviderRegistry::new();
        registry.replace_all(&[
            provider_model(1, 1, 1, &["gpt-4o-mini"], "default"),
            provider_model(2, 9, 1, &["claude-3-5-haiku"], "default"),
            provider_model(3, 9, 1, &["gpt-4o-mini"], "premium"),
        ]);
        let resolved = registry.resolve("gpt-4o-mini", "default", false);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, 1);

        let crossed = registry.resolve("gpt-4o-mini", "default", true);
        let ids: Vec<i64> = crossed.iter().map(|provider| provider.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn weighted_shuffle_respects_tier_membership() {
        let registry = ProviderRegistry::new();
        registry.replace_all(&[
            provider_model(1, 5, 1, &["m"], "default"),
            provider_model(2, 5, 100, &["m"], "default"),
            provider_model(3, 1, 1, &["m"], "default"),
        ]);
        for _ in 0..10 {
            let resolved = registry.resolve("m", "default", false);
            // Tier {1,2} always precedes the lone priority-1 provider.
            assert_eq!(resolved[2].id, 3);
        }
    }

    #[test]
    fn model_union_intersects_whitelist() {
        let registry = ProviderRegistry::new();
        registry.replace_all(&[
            provider_model(1, 1, 1, &["a", "b"], "default"),
            provider_model(2, 1, 1, &["b", "c"], "default"),
        ]);
        assert_eq!(registry.all_models(&[]), vec!["a", "b", "c"]);
        let whitelist = vec!["b".to_string(), "zzz".to_string()];
        assert_eq!(registry.all_models(&whitelist), vec!["b"]);
    }

    #[test]
    fn model_mapping_rewrites_upstream_name() {
        let mut model = provider_model(1, 1, 1, &["claude-sonnet-4-5"], "default");
        model.model_mapping =
            r#"{"claude-sonnet-4-5": "CLAUDE_SONNET_4_5_20250929_V1_0"}"#.to_string();
        let provider = Provider::from_model(&model);
        assert_eq!(
            provider.upstream_model("claude-sonnet-4-5"),
            "CLAUDE_SONNET_4_5_20250929_V1_0"
        );
        assert_eq!(provider.upstream_model("other"), "other");
    }
}
