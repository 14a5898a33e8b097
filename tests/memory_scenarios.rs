//! 记忆层集成测试：容量与 TTL、重要度准入、确定性检索、重启后恢复

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use hive::config::MemoryConfig;
    use hive::memory::{
        EpisodeOutcome, EpisodicEntry, LongTermEntry, MemoryItem, MemoryKind, MemoryManager,
        ShortTermStore, StoreOutcome, TaskSnapshot, WriteOutcome,
    };
    use uuid::Uuid;

    fn snapshot(description: &str) -> TaskSnapshot {
        TaskSnapshot {
            task_id: Uuid::new_v4(),
            description: description.to_string(),
            retry_count: 0,
            context: BTreeMap::new(),
        }
    }

    #[test]
    fn test_101_keys_evict_first_inserted() {
        let store = ShortTermStore::new(100, Duration::from_secs(3600));
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut evicted = Vec::new();
        for i in 0..101 {
            let at = t0 + chrono::Duration::seconds(i);
            if let Some(key) = store.put_at(format!("key-{i}"), format!("value-{i}"), at) {
                evicted.push(key);
            }
            assert!(store.len() <= 100);
        }
        assert_eq!(evicted, vec!["key-0".to_string()]);

        let now = t0 + chrono::Duration::seconds(200);
        assert_eq!(store.get_at("key-0", now), None);
        for i in 1..101 {
            assert_eq!(store.get_at(&format!("key-{i}"), now), Some(format!("value-{i}")));
        }
    }

    #[test]
    fn test_entry_unreachable_after_ttl() {
        let store = ShortTermStore::new(100, Duration::from_secs(3600));
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        store.put_at("session", "draft", t0);
        assert_eq!(
            store.get_at("session", t0 + chrono::Duration::seconds(3600)),
            Some("draft".to_string())
        );
        assert_eq!(store.get_at("session", t0 + chrono::Duration::seconds(3601)), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_low_importance_write_declined() {
        let memory = MemoryManager::in_memory(&MemoryConfig::default()).unwrap();
        let outcome = memory
            .store(MemoryItem::LongTerm(LongTermEntry::new("the vault code is 1234", 0.2)))
            .unwrap();
        assert!(matches!(
            outcome,
            StoreOutcome::LongTerm(WriteOutcome::Declined { .. })
        ));
        assert_eq!(memory.long_term().len(), 0);

        let hits = memory.retrieve("the vault code is 1234", 10).unwrap();
        assert!(hits.iter().all(|h| h.item.kind() != MemoryKind::LongTerm));
    }

    fn populated() -> MemoryManager {
        let memory = MemoryManager::in_memory(&MemoryConfig::default()).unwrap();
        memory.short_term().put("last_query", "rust async runtime comparison");
        for (content, importance) in [
            ("tokio is a multi-threaded async runtime for rust", 0.9),
            ("async-std offers a std-like async api", 0.6),
            ("sqlite stores data in a single file", 0.5),
        ] {
            memory
                .store(MemoryItem::LongTerm(LongTermEntry::new(content, importance)))
                .unwrap();
        }
        memory
            .store(MemoryItem::Episodic(EpisodicEntry::new(
                snapshot("compare rust async runtimes"),
                EpisodeOutcome::Failed {
                    cause: "benchmarks missing".into(),
                },
                vec!["include benchmarks".into()],
            )))
            .unwrap();
        memory
            .semantic()
            .upsert("rust async runtimes need an executor", 0.8, ["tokio is an executor"])
            .unwrap();
        memory
    }

    #[test]
    fn test_retrieval_is_deterministic() {
        let memory = populated();
        let now = Utc::now() + chrono::Duration::seconds(5);
        let first = memory.retrieve_at("rust async runtimes", 5, now).unwrap();
        let second = memory.retrieve_at("rust async runtimes", 5, now).unwrap();
        assert!(!first.is_empty());
        assert!(first.len() <= 5);
        assert_eq!(first, second);
        assert!(first.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_context_covers_each_kind() {
        let memory = populated();
        let context = memory.context_for_task("rust async runtimes", 10);
        assert!(context.degraded.is_none());
        let kinds: Vec<MemoryKind> = context.items.iter().map(|i| i.item.kind()).collect();
        assert!(kinds.contains(&MemoryKind::LongTerm));
        assert!(kinds.contains(&MemoryKind::Episodic));
        let section = context.to_prompt_section();
        assert!(section.contains("Similar Past Tasks"));
    }

    #[test]
    fn test_persistent_stores_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfig {
            persist_dir: Some(dir.path().to_path_buf()),
            ..MemoryConfig::default()
        };

        let stored_id = {
            let memory = MemoryManager::from_config(&config).unwrap();
            let outcome = memory
                .store(MemoryItem::LongTerm(LongTermEntry::new("deploys happen on fridays", 0.7)))
                .unwrap();
            memory
                .store(MemoryItem::Episodic(EpisodicEntry::new(
                    snapshot("schedule deploy"),
                    EpisodeOutcome::Succeeded { score: 8.0 },
                    vec![],
                )))
                .unwrap();
            memory.semantic().upsert("deploys need approval", 0.4, Vec::<String>::new()).unwrap();
            memory.semantic().upsert("deploys need approval", 0.9, Vec::<String>::new()).unwrap();
            memory.short_term().put("scratch", "not persisted");
            memory.flush().unwrap();
            match outcome {
                StoreOutcome::LongTerm(WriteOutcome::Stored(id)) => id,
                other => panic!("unexpected outcome {other:?}"),
            }
        };

        let memory = MemoryManager::from_config(&config).unwrap();
        let stats = memory.stats();
        assert_eq!(stats.long_term, 1);
        assert_eq!(stats.episodic, 1);
        assert_eq!(stats.semantic, 1);
        assert_eq!(stats.short_term, 0);
        assert_eq!(
            memory.long_term().get(&stored_id).unwrap().content,
            "deploys happen on fridays"
        );
        // 0.6 * 0.9 + 0.4 * 0.4
        let fact = memory.semantic().get("deploys need approval").unwrap();
        assert!((fact.confidence - 0.7).abs() < 1e-5);
        assert_eq!(fact.observations, 2);

        let hits = memory.episodic().find_similar("schedule the deploy", 1).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_promote_moves_short_term_into_long_term() {
        let memory = Arc::new(MemoryManager::in_memory(&MemoryConfig::default()).unwrap());
        memory.short_term().put("insight", "batch writes are faster");
        let outcome = memory.promote("insight", 0.8).unwrap().unwrap();
        assert!(outcome.is_stored());
        assert!(memory.short_term().peek("insight").is_none());
        assert_eq!(memory.long_term().len(), 1);
        assert!(memory.promote("missing", 0.8).unwrap().is_none());
    }
}
