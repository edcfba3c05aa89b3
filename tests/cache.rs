#![deny(rust_2018_idioms)]

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use webparse::{Binary, Buf};
    use wmgate::{
        CacheConfig, CacheKey, CacheLookup, FileAddress, HttpCache, ProtResult, ResourceAddress,
        TableOracle, TranslateCache, TranslateOracle, TranslateRequest, TranslateResponse,
    };

    fn lookup_fn<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.to_string())
        }
    }

    fn insert_entry(
        cache: &Arc<HttpCache>,
        key: &CacheKey,
        vary: Vec<String>,
        headers: &[(&str, &str)],
        body: &str,
    ) {
        let lookup = lookup_fn(headers);
        match cache.lookup(key, &lookup) {
            CacheLookup::Miss(guard) => {
                guard.complete(
                    vary,
                    &lookup,
                    Some(Duration::from_secs(60)),
                    200,
                    vec![("content-type".to_string(), "text/plain".to_string())],
                    Binary::from(body.as_bytes().to_vec()),
                );
            }
            _ => panic!("expected miss"),
        }
    }

    #[tokio::test]
    async fn test_vary_distinguishes_listed_header() {
        let cache = HttpCache::new(CacheConfig::default());
        let key = CacheKey::new("GET", "host/qs");

        insert_entry(
            &cache,
            &key,
            vec!["accept-language".to_string()],
            &[("accept-language", "de")],
            "german",
        );

        // vary 头相同 → 命中
        match cache.lookup(&key, &lookup_fn(&[("accept-language", "de")])) {
            CacheLookup::Hit(hit) => assert_eq!(hit.body.chunk(), b"german"),
            _ => panic!("expected hit"),
        }
        // vary 头不同 → 不命中
        match cache.lookup(&key, &lookup_fn(&[("accept-language", "fr")])) {
            CacheLookup::Miss(guard) => guard.abandon(),
            _ => panic!("expected miss"),
        }
        // 不在 vary 名单里的头不影响命中
        match cache.lookup(
            &key,
            &lookup_fn(&[("accept-language", "de"), ("x-whatever", "1")]),
        ) {
            CacheLookup::Hit(_) => {}
            _ => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn test_invalidate_by_header_value() {
        let cache = HttpCache::new(CacheConfig::default());
        let key = CacheKey::new("GET", "host/doc");
        insert_entry(
            &cache,
            &key,
            vec!["x-foo".to_string()],
            &[("x-foo", "alpha")],
            "body",
        );
        assert_eq!(cache.len(), 1);

        // 取值不同的失效请求不动存量
        cache.invalidate(&["x-foo".to_string()], &lookup_fn(&[("x-foo", "beta")]));
        assert_eq!(cache.len(), 1);

        // 取值相同的失效请求把条目摘掉
        cache.invalidate(&["x-foo".to_string()], &lookup_fn(&[("x-foo", "alpha")]));
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_single_flight_per_key() {
        let cache = HttpCache::new(CacheConfig::default());
        let key = CacheKey::new("GET", "host/sf");
        let lookup = lookup_fn(&[]);

        let guard = match cache.lookup(&key, &lookup) {
            CacheLookup::Miss(guard) => guard,
            _ => panic!("expected miss"),
        };
        // 第二个同指纹查询要挂起等第一个
        let wait = match cache.lookup(&key, &lookup) {
            CacheLookup::Wait(receiver) => receiver,
            _ => panic!("expected wait"),
        };
        guard.complete(
            vec![],
            &lookup,
            None,
            200,
            vec![],
            Binary::from(b"cached".to_vec()),
        );
        let _ = wait.await;
        match cache.lookup(&key, &lookup) {
            CacheLookup::Hit(hit) => assert_eq!(hit.body.chunk(), b"cached"),
            _ => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn test_oversized_body_not_cached() {
        let cache = HttpCache::new(CacheConfig {
            max_size: 1024,
            max_body_size: 8,
            default_max_age: Duration::from_secs(60),
        });
        let key = CacheKey::new("GET", "host/big");
        let lookup = lookup_fn(&[]);
        match cache.lookup(&key, &lookup) {
            CacheLookup::Miss(guard) => {
                guard.complete(
                    vec![],
                    &lookup,
                    None,
                    200,
                    vec![],
                    Binary::from(vec![0u8; 64]),
                );
            }
            _ => panic!("expected miss"),
        }
        assert_eq!(cache.len(), 0);
    }

    /// 记录调用次数的翻译桩
    struct CountingOracle {
        inner: TableOracle,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TranslateOracle for CountingOracle {
        async fn translate(&self, request: &TranslateRequest) -> ProtResult<TranslateResponse> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.translate(request).await
        }
    }

    #[tokio::test]
    async fn test_translate_cache_base_regex() {
        let mut table = TableOracle::new();
        table.add(
            "/a/",
            TranslateResponse {
                address: ResourceAddress::Local(FileAddress {
                    path: "/var/www/\\1".to_string(),
                    ..Default::default()
                }),
                base: Some("/a/".to_string()),
                regex: Some(r"^(.*\.jpg)$".to_string()),
                ..Default::default()
            },
        );
        let oracle = Arc::new(CountingOracle {
            inner: table,
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let cache = TranslateCache::new(oracle.clone(), Duration::from_secs(60));

        let first = cache
            .translate(&TranslateRequest::new("/a/x.jpg", "host"))
            .await
            .unwrap();
        match &first.address {
            ResourceAddress::Local(file) => assert_eq!(file.path, "/var/www/x.jpg"),
            other => panic!("unexpected address {:?}", other),
        }
        assert_eq!(oracle.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        // 同 base 下另一个 jpg: 缓存命中并用新捕获组展开
        let second = cache
            .translate(&TranslateRequest::new("/a/y.jpg", "host"))
            .await
            .unwrap();
        match &second.address {
            ResourceAddress::Local(file) => assert_eq!(file.path, "/var/www/y.jpg"),
            other => panic!("unexpected address {:?}", other),
        }
        assert_eq!(oracle.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        // 正则不匹配的后缀要重新问翻译
        let _third = cache
            .translate(&TranslateRequest::new("/a/x.html", "host"))
            .await
            .unwrap();
        assert_eq!(oracle.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_translate_cache_inverse_regex() {
        let mut table = TableOracle::new();
        table.add(
            "/b/",
            TranslateResponse {
                address: ResourceAddress::Local(FileAddress {
                    path: "/srv/static".to_string(),
                    ..Default::default()
                }),
                base: Some("/b/".to_string()),
                inverse_regex: Some(r"\.jpg$".to_string()),
                ..Default::default()
            },
        );
        let oracle = Arc::new(CountingOracle {
            inner: table,
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let cache = TranslateCache::new(oracle.clone(), Duration::from_secs(60));

        let _ = cache
            .translate(&TranslateRequest::new("/b/page.html", "host"))
            .await
            .unwrap();
        assert_eq!(oracle.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        // inverse_regex 匹配的后缀不适用缓存条目
        let _ = cache
            .translate(&TranslateRequest::new("/b/img.jpg", "host"))
            .await
            .unwrap();
        assert_eq!(oracle.calls.load(std::sync::atomic::Ordering::SeqCst), 2);

        // html 再来一次应该还在缓存里
        let _ = cache
            .translate(&TranslateRequest::new("/b/other.html", "host"))
            .await
            .unwrap();
        assert_eq!(oracle.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
