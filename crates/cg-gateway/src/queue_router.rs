//! QueueRouter - pick the queue for a URL by pattern match and live load
//!
//! Pattern overlap is a load-balancing knob, not a conflict: when several
//! enabled queues admit a path, the one with the lowest live load wins, ties
//! broken by highest priority, then by earliest declaration. Load lookups
//! that fail read as infinite so a broken queue never steals traffic.

use cg_common::normalize_path;
use std::sync::Arc;
use tracing::debug;

use crate::registry::QueueRegistry;

/// Match a queue URL pattern against a normalized path. `/prefix/*` means a
/// one-or-more-segment prefix; anything else is an exact match.
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix("/*") {
        let prefix = normalize_path(prefix);
        if prefix == "/" {
            return path.len() > 1;
        }
        return path.starts_with(&format!("{}/", prefix));
    }
    path == normalize_path(pattern)
}

pub struct QueueRouter {
    registry: Arc<QueueRegistry>,
}

impl QueueRouter {
    pub fn new(registry: Arc<QueueRegistry>) -> Self {
        Self { registry }
    }

    /// Choose the queue for a URL. Falls back to the default queue when no
    /// enabled definition's patterns match.
    pub async fn choose_queue(&self, url: &str) -> String {
        let path = normalize_path(url);
        let defs = self.registry.list().await;

        let candidates: Vec<&cg_common::QueueDefinition> = defs
            .iter()
            .filter(|def| {
                def.enabled
                    && def
                        .url_patterns
                        .iter()
                        .any(|pattern| pattern_matches(pattern, &path))
            })
            .collect();

        match candidates.len() {
            0 => self.registry.default_queue_name().await,
            1 => candidates[0].name.clone(),
            _ => {
                // (load asc, priority desc, declaration order asc)
                let mut best: Option<(u64, i32, usize, &str)> = None;
                for (index, def) in candidates.iter().enumerate() {
                    let load = self.registry.load(&def.name).await;
                    debug!(queue = %def.name, load = load, "Router candidate");
                    let key = (load, -def.priority, index);
                    match best {
                        Some((bl, bp, bi, _)) if (bl, bp, bi) <= key => {}
                        _ => best = Some((load, -def.priority, index, &def.name)),
                    }
                }
                best.map(|(_, _, _, name)| name.to_string())
                    .unwrap_or_else(|| candidates[0].name.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cg_common::{QueueDefinition, QueueSystemConfig};
    use cg_store::MemoryStore;

    fn def(name: &str, priority: i32, patterns: &[&str]) -> QueueDefinition {
        let mut d = QueueDefinition::new(name);
        d.priority = priority;
        d.url_patterns = patterns.iter().map(|s| s.to_string()).collect();
        d
    }

    async fn registry_with(queues: Vec<QueueDefinition>) -> Arc<QueueRegistry> {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(QueueRegistry::new(
            store,
            "queues:config",
            "queues:config:events",
            "test-instance",
        ));
        let config = QueueSystemConfig {
            queues,
            default_queue: "standard".to_string(),
            job_ttl_secs: 3600,
            polling_timeout_secs: 30,
        };
        registry.init(config).await.unwrap();
        registry
    }

    #[test]
    fn pattern_matching_rules() {
        assert!(pattern_matches("/vip/*", "/vip/enroll"));
        assert!(pattern_matches("/vip/*", "/vip/a/b"));
        assert!(!pattern_matches("/vip/*", "/vip"));
        assert!(pattern_matches("/courses", "/courses"));
        assert!(!pattern_matches("/courses", "/courses/1"));
        assert!(pattern_matches("/*", "/anything"));
        assert!(!pattern_matches("/*", "/"));
    }

    #[tokio::test]
    async fn falls_back_to_default_queue() {
        let registry = registry_with(vec![
            def("standard", 5, &[]),
            def("vip", 10, &["/vip/*"]),
        ])
        .await;
        let router = QueueRouter::new(registry);
        assert_eq!(router.choose_queue("/courses").await, "standard");
    }

    #[tokio::test]
    async fn single_match_wins() {
        let registry = registry_with(vec![
            def("standard", 5, &[]),
            def("vip", 10, &["/vip/*"]),
        ])
        .await;
        let router = QueueRouter::new(registry);
        assert_eq!(router.choose_queue("/vip/enroll").await, "vip");
    }

    #[tokio::test]
    async fn lowest_load_wins_among_overlapping_patterns() {
        let registry = registry_with(vec![
            def("standard", 5, &[]),
            def("a", 1, &["/hot/*"]),
            def("b", 1, &["/hot/*"]),
        ])
        .await;

        // Put load on queue "a" so "b" becomes the lighter choice.
        let handle = registry.handle("a").await.unwrap();
        let job = crate::test_util::make_job("j1");
        handle.enqueue(job, 1).unwrap();

        let router = QueueRouter::new(registry);
        assert_eq!(router.choose_queue("/hot/path").await, "b");
    }

    #[tokio::test]
    async fn priority_breaks_load_ties() {
        let registry = registry_with(vec![
            def("standard", 5, &[]),
            def("low", 1, &["/hot/*"]),
            def("high", 9, &["/hot/*"]),
        ])
        .await;
        let router = QueueRouter::new(registry);
        assert_eq!(router.choose_queue("/hot/path").await, "high");
    }

    #[tokio::test]
    async fn declaration_order_breaks_full_ties() {
        let registry = registry_with(vec![
            def("standard", 5, &[]),
            def("first", 3, &["/hot/*"]),
            def("second", 3, &["/hot/*"]),
        ])
        .await;
        let router = QueueRouter::new(registry);
        assert_eq!(router.choose_queue("/hot/path").await, "first");
    }

    #[tokio::test]
    async fn disabled_queues_are_skipped() {
        let mut disabled = def("vip", 10, &["/vip/*"]);
        disabled.enabled = false;
        let registry = registry_with(vec![def("standard", 5, &[]), disabled]).await;
        let router = QueueRouter::new(registry);
        assert_eq!(router.choose_queue("/vip/enroll").await, "standard");
    }
}
