#![deny(rust_2018_idioms)]

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wmgate::{SessionConfig, SessionId, SessionManager};

    #[test]
    fn test_cluster_node_layout() {
        // 任意 id 折到任意 (规模, 节点) 后, 低字模规模等于节点号
        for _ in 0..64 {
            for (size, node) in [(2u32, 0u32), (2, 1), (3, 2), (7, 4), (16, 15)] {
                let mut id = SessionId::generate();
                id.set_cluster_node(size, node);
                assert_eq!(id.cluster_hash() % size, node);
            }
        }
    }

    #[test]
    fn test_format_parse_roundtrip() {
        let id = SessionId::generate();
        let text = format!("{}", id);
        assert_eq!(text.len(), 64);
        let parsed = SessionId::parse(&text).unwrap();
        assert_eq!(parsed, id);

        assert!(SessionId::parse("short").is_none());
        assert!(SessionId::parse(&"g".repeat(64)).is_none());
    }

    #[test]
    fn test_manager_create_find_touch() {
        let manager = SessionManager::new(SessionConfig::default());
        let id = manager.create();
        assert!(manager.exists(&id));
        assert!(!manager.exists(&SessionId::generate()));

        let counter = manager.with_session(&id, |s| s.counter).unwrap();
        // 访问即触碰, 计数随之增长
        assert!(counter >= 1);
        let counter2 = manager.with_session(&id, |s| s.counter).unwrap();
        assert!(counter2 > counter);
    }

    #[test]
    fn test_manager_cleanup_expired() {
        let manager = SessionManager::new(SessionConfig {
            idle_timeout: Duration::from_millis(0),
            ..Default::default()
        });
        let id = manager.create();
        std::thread::sleep(Duration::from_millis(5));
        let removed = manager.cleanup();
        assert_eq!(removed, 1);
        assert!(!manager.exists(&id));
    }

    #[test]
    fn test_cookie_value() {
        let manager = SessionManager::new(SessionConfig {
            cookie_name: "sid".to_string(),
            cookie_host: Some("example.com".to_string()),
            cookie_path: "/app".to_string(),
            ..Default::default()
        });
        let id = manager.create();
        let cookie = manager.cookie_for(&id);
        assert!(cookie.starts_with(&format!("sid={}", id)));
        assert!(cookie.contains("Path=/app"));
        assert!(cookie.contains("Domain=example.com"));
    }

    #[test]
    fn test_generated_sessions_respect_cluster_config() {
        let manager = SessionManager::new(SessionConfig {
            cluster: Some((4, 3)),
            ..Default::default()
        });
        for _ in 0..16 {
            let id = manager.create();
            assert_eq!(id.cluster_hash() % 4, 3);
        }
    }
}
