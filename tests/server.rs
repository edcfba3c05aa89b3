#![deny(rust_2018_idioms)]

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::atomic::{AtomicUsize, Ordering},
        sync::Arc,
    };

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };
    use wmgate::{
        serve, FileAddress, HttpAddress, ProxyConfig, ProxyContext, ResourceAddress, TableOracle,
        TranslateResponse, Transformation, View,
    };

    /// 极简的后端: 按路径回固定内容, 顺带数请求次数
    async fn spawn_backend(
        routes: Vec<(&'static str, &'static str, &'static str)>,
    ) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                let routes = routes.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut data = vec![];
                    loop {
                        let n = match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        data.extend_from_slice(&buf[..n]);
                        if data.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    let line = String::from_utf8_lossy(&data);
                    let path = line.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let path = path.split('?').next().unwrap_or("/").to_string();
                    let (content_type, body) = routes
                        .iter()
                        .find(|(p, _, _)| *p == path)
                        .map(|(_, t, b)| (*t, *b))
                        .unwrap_or(("text/plain", "not found"));
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        content_type,
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        (addr, hits)
    }

    /// 客户端直连: 发一个请求, 收全响应 (Connection: close)
    async fn http_request(
        addr: SocketAddr,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> (u16, String, Vec<u8>) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut request = format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n",
            method, path
        );
        for (name, value) in headers {
            request.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !body.is_empty() {
            request.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        stream.write_all(body).await.unwrap();

        let mut raw = vec![];
        stream.read_to_end(&mut raw).await.unwrap();
        let split = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("no header end");
        let head = String::from_utf8_lossy(&raw[..split]).to_string();
        let status: u16 = head
            .lines()
            .next()
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|s| s.parse().ok())
            .unwrap();
        let mut payload = raw[split + 4..].to_vec();
        if head.to_ascii_lowercase().contains("transfer-encoding: chunked") {
            payload = decode_chunked(&payload);
        }
        (status, head, payload)
    }

    fn decode_chunked(data: &[u8]) -> Vec<u8> {
        let mut out = vec![];
        let mut pos = 0;
        loop {
            let line_end = match data[pos..].windows(2).position(|w| w == b"\r\n") {
                Some(v) => pos + v,
                None => break,
            };
            let size = usize::from_str_radix(
                String::from_utf8_lossy(&data[pos..line_end]).trim(),
                16,
            )
            .unwrap_or(0);
            if size == 0 {
                break;
            }
            let start = line_end + 2;
            out.extend_from_slice(&data[start..start + size]);
            pos = start + size + 2;
        }
        out
    }

    fn quiet_config() -> ProxyConfig {
        ProxyConfig {
            verbose_response: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_static_file_request() {
        let dir = std::env::temp_dir().join(format!("wmgate-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("index.html");
        std::fs::write(&file, b"hello").unwrap();

        let mut oracle = TableOracle::new();
        oracle.add(
            "/hello",
            TranslateResponse {
                address: ResourceAddress::Local(FileAddress {
                    path: file.to_str().unwrap().to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        let ctx = ProxyContext::new(quiet_config(), Arc::new(oracle));
        let addr = serve(ctx, "127.0.0.1:0").await.unwrap();

        let (status, head, body) = http_request(addr, "GET", "/hello", &[], b"").await;
        assert_eq!(status, 200);
        assert_eq!(body, b"hello");
        assert!(head.to_ascii_lowercase().contains("content-length: 5"));
    }

    #[tokio::test]
    async fn test_not_found_when_translation_says_so() {
        let oracle = TableOracle::new();
        let ctx = ProxyContext::new(quiet_config(), Arc::new(oracle));
        let addr = serve(ctx, "127.0.0.1:0").await.unwrap();
        let (status, _, _) = http_request(addr, "GET", "/nowhere", &[], b"").await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn test_http_backend_proxying() {
        let (backend, _) = spawn_backend(vec![("/data", "text/plain", "proxied")]).await;
        let mut oracle = TableOracle::new();
        oracle.add(
            "/p",
            TranslateResponse {
                address: ResourceAddress::Http(HttpAddress {
                    address: backend.to_string(),
                    host_header: None,
                    path: "/data".to_string(),
                }),
                ..Default::default()
            },
        );
        let ctx = ProxyContext::new(quiet_config(), Arc::new(oracle));
        let addr = serve(ctx, "127.0.0.1:0").await.unwrap();
        let (status, _, body) = http_request(addr, "GET", "/p", &[], b"").await;
        assert_eq!(status, 200);
        assert_eq!(body, b"proxied");
    }

    #[tokio::test]
    async fn test_widget_composition() {
        // 模板里嵌一个部件, 部件体要按模板位置拼进输出
        let (backend, _) = spawn_backend(vec![
            (
                "/tpl",
                "text/html",
                "<html><beng:widget type=\"sync\"/></html>",
            ),
            ("/w", "text/html", "WIDGET"),
        ])
        .await;

        let mut oracle = TableOracle::new();
        oracle.add(
            "/x",
            TranslateResponse {
                address: ResourceAddress::Http(HttpAddress {
                    address: backend.to_string(),
                    host_header: None,
                    path: "/tpl".to_string(),
                }),
                views: vec![View {
                    name: None,
                    transformations: vec![Transformation::Process { container: true }],
                }],
                container: true,
                ..Default::default()
            },
        );
        oracle.add_widget(
            "sync",
            TranslateResponse {
                address: ResourceAddress::Http(HttpAddress {
                    address: backend.to_string(),
                    host_header: None,
                    path: "/w".to_string(),
                }),
                ..Default::default()
            },
        );

        let ctx = ProxyContext::new(quiet_config(), Arc::new(oracle));
        let addr = serve(ctx, "127.0.0.1:0").await.unwrap();
        let (status, _, body) = http_request(addr, "GET", "/x", &[], b"").await;
        assert_eq!(status, 200);
        let text = String::from_utf8_lossy(&body);
        assert_eq!(text, "<html>WIDGET</html>");
    }

    #[tokio::test]
    async fn test_untrusted_widget_refused_with_placeholder() {
        let (backend, _) = spawn_backend(vec![
            (
                "/tpl",
                "text/html",
                "<html><beng:widget type=\"evil\"/></html>",
            ),
            ("/w", "text/html", "SHOULD NOT APPEAR"),
        ])
        .await;

        let mut oracle = TableOracle::new();
        oracle.add(
            "/x",
            TranslateResponse {
                address: ResourceAddress::Http(HttpAddress {
                    address: backend.to_string(),
                    host_header: None,
                    path: "/tpl".to_string(),
                }),
                views: vec![View {
                    name: None,
                    transformations: vec![Transformation::Process { container: true }],
                }],
                container: true,
                ..Default::default()
            },
        );
        // 只许在指定的不受信主机上出现的部件
        oracle.add_widget(
            "evil",
            TranslateResponse {
                address: ResourceAddress::Http(HttpAddress {
                    address: backend.to_string(),
                    host_header: None,
                    path: "/w".to_string(),
                }),
                untrusted_host: Some("evil.example".to_string()),
                ..Default::default()
            },
        );

        let ctx = ProxyContext::new(quiet_config(), Arc::new(oracle));
        let addr = serve(ctx, "127.0.0.1:0").await.unwrap();
        let (status, _, body) = http_request(addr, "GET", "/x", &[], b"").await;
        assert_eq!(status, 200);
        let text = String::from_utf8_lossy(&body);
        assert!(!text.contains("SHOULD NOT APPEAR"));
        assert!(text.contains("widget-error"));
    }

    #[tokio::test]
    async fn test_cache_second_request_skips_backend() {
        let (backend, hits) = spawn_backend(vec![("/qs", "text/plain", "cached body")]).await;
        let mut oracle = TableOracle::new();
        oracle.add(
            "/qs",
            TranslateResponse {
                address: ResourceAddress::Http(HttpAddress {
                    address: backend.to_string(),
                    host_header: None,
                    path: "/qs".to_string(),
                }),
                max_age: Some(std::time::Duration::from_secs(60)),
                ..Default::default()
            },
        );
        let ctx = ProxyContext::new(quiet_config(), Arc::new(oracle));
        let addr = serve(ctx, "127.0.0.1:0").await.unwrap();

        let (status1, _, body1) = http_request(addr, "GET", "/qs?abc", &[], b"").await;
        let (status2, _, body2) = http_request(addr, "GET", "/qs?abc", &[], b"").await;
        assert_eq!(status1, 200);
        assert_eq!(status2, 200);
        assert_eq!(body1, b"cached body");
        assert_eq!(body2, b"cached body");
        // 第二个请求由缓存服务
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_vary_header_split_entries() {
        let (backend, hits) = spawn_backend(vec![("/v", "text/plain", "variant")]).await;
        let mut oracle = TableOracle::new();
        oracle.add(
            "/v",
            TranslateResponse {
                address: ResourceAddress::Http(HttpAddress {
                    address: backend.to_string(),
                    host_header: None,
                    path: "/v".to_string(),
                }),
                vary: vec!["accept-language".to_string()],
                max_age: Some(std::time::Duration::from_secs(60)),
                ..Default::default()
            },
        );
        let ctx = ProxyContext::new(quiet_config(), Arc::new(oracle));
        let addr = serve(ctx, "127.0.0.1:0").await.unwrap();

        let _ = http_request(addr, "GET", "/v", &[("Accept-Language", "de")], b"").await;
        let _ = http_request(addr, "GET", "/v", &[("Accept-Language", "de")], b"").await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // 列在 vary 里的头不同 → 独立条目, 再回源一次
        let _ = http_request(addr, "GET", "/v", &[("Accept-Language", "fr")], b"").await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        // 没列的头不同 → 还是同一条
        let _ = http_request(
            addr,
            "GET",
            "/v",
            &[("Accept-Language", "de"), ("X-Whatever", "zzz")],
            b"",
        )
        .await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_session_cookie_issued() {
        let dir = std::env::temp_dir().join(format!("wmgate-sess-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("s.html");
        std::fs::write(&file, b"stateful").unwrap();

        let mut oracle = TableOracle::new();
        oracle.add(
            "/s",
            TranslateResponse {
                address: ResourceAddress::Local(FileAddress {
                    path: file.to_str().unwrap().to_string(),
                    ..Default::default()
                }),
                stateful: true,
                session_cookie: Some("wmgate_session".to_string()),
                ..Default::default()
            },
        );
        let ctx = ProxyContext::new(quiet_config(), Arc::new(oracle));
        let addr = serve(ctx, "127.0.0.1:0").await.unwrap();
        let (status, head, _) = http_request(addr, "GET", "/s", &[], b"").await;
        assert_eq!(status, 200);
        assert!(head.to_ascii_lowercase().contains("set-cookie: wmgate_session="));
    }

    #[tokio::test]
    async fn test_redirect_short_circuit() {
        let mut oracle = TableOracle::new();
        oracle.add(
            "/old",
            TranslateResponse {
                redirect: Some("/new".to_string()),
                ..Default::default()
            },
        );
        let ctx = ProxyContext::new(quiet_config(), Arc::new(oracle));
        let addr = serve(ctx, "127.0.0.1:0").await.unwrap();
        let (status, head, _) = http_request(addr, "GET", "/old", &[], b"").await;
        assert_eq!(status, 302);
        assert!(head.to_ascii_lowercase().contains("location: /new"));
    }

    #[tokio::test]
    async fn test_backend_down_yields_502() {
        let mut oracle = TableOracle::new();
        oracle.add(
            "/dead",
            TranslateResponse {
                address: ResourceAddress::Http(HttpAddress {
                    address: "127.0.0.1:1".to_string(),
                    host_header: None,
                    path: "/".to_string(),
                }),
                ..Default::default()
            },
        );
        let ctx = ProxyContext::new(quiet_config(), Arc::new(oracle));
        let addr = serve(ctx, "127.0.0.1:0").await.unwrap();
        let (status, _, _) = http_request(addr, "GET", "/dead", &[], b"").await;
        assert_eq!(status, 502);
    }
}
