// Copyright 2023 - 2024 Wmgate See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh
// -----
// Created Date: 2023/12/11 10:30:27

use std::{net::SocketAddr, sync::Arc, time::Instant};

use async_trait::async_trait;
use tokio::net::UnixStream;
use webparse::{BinaryMut, Buf, HeaderName, Request, Response};

use crate::{
    cache::{CacheKey, CacheLookup},
    client::ajp::AjpRequestInfo,
    client::fcgi::FcgiRequestInfo,
    client::header_value,
    client::{AjpClient, FcgiClient, HttpClient, WasClient},
    AccessLogEntry, AccessLogger, Body, ChildAddress, ChildConfig, ChildSocketBuilder, ChildStock,
    Consts, CssProcessor, HttpAddress, HttpCache, InlineEnv, Processor, ProcessorEnv, ProtError,
    ProtResult, ProxyConfig, RecvRequest, RecvResponse, ResourceAddress, RewriteEnv, SessionId,
    SessionManager, SocketLease, Stock, SubRequestDispatch, TcpStockBuilder, TextProcessor,
    TranslateCache, TranslateOracle, TranslateRequest, TranslateResponse, Transformation, View,
    WidgetRegistry, WidgetTree,
};

use super::{cgi, forward, static_file};

/// 一次请求里从查询串解出的组装参数
#[derive(Debug, Clone, Default)]
struct FrameArgs {
    focus: Option<String>,
    path: Option<String>,
    frame: Option<String>,
    raw: bool,
    view: Option<String>,
    args: Option<String>,
}

fn parse_frame_args(query: Option<&str>) -> FrameArgs {
    let mut out = FrameArgs::default();
    let query = match query {
        Some(v) => v,
        None => return out,
    };
    for pair in query.split('&') {
        let (name, value) = match pair.split_once('=') {
            Some(v) => v,
            None => continue,
        };
        let value = unescape_query(value);
        match name {
            "focus" => out.focus = Some(value),
            "path" => out.path = Some(value),
            "frame" => out.frame = Some(value),
            "raw" => out.raw = value == "1",
            "view" => out.view = Some(value),
            "args" => out.args = Some(value),
            _ => {}
        }
    }
    out
}

fn unescape_query(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match u8::from_str_radix(&value[i + 1..i + 3], 16) {
                    Ok(b) => {
                        out.push(b);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).to_string()
}

/// 全局上下文: 所有池, 缓存与配置的汇聚点, 显式传递不搞单例
pub struct ProxyContext {
    pub config: ProxyConfig,
    pub tcache: Arc<TranslateCache>,
    pub http_cache: Arc<HttpCache>,
    pub tcp_stock: Arc<Stock<TcpStockBuilder>>,
    pub child_stock: Arc<ChildStock>,
    pub child_sockets: Arc<Stock<ChildSocketBuilder>>,
    pub registry: Arc<WidgetRegistry>,
    pub sessions: Arc<SessionManager>,
    pub logger: Arc<AccessLogger>,
}

impl ProxyContext {
    pub fn new(config: ProxyConfig, oracle: Arc<dyn TranslateOracle>) -> Arc<Self> {
        let tcache = Arc::new(TranslateCache::new(oracle, config.cache.default_max_age));
        let http_cache = HttpCache::new(config.cache.clone());
        let tcp_stock = Stock::new(TcpStockBuilder, config.stock.clone());
        let child_stock = ChildStock::new(std::env::temp_dir());
        let child_sockets = Stock::new(
            ChildSocketBuilder::new(child_stock.clone()),
            config.stock.clone(),
        );
        let registry = WidgetRegistry::new(tcache.clone());
        let sessions = Arc::new(SessionManager::new(config.session.clone()));
        let logger = Arc::new(AccessLogger::stderr());
        Arc::new(Self {
            config,
            tcache,
            http_cache,
            tcp_stock,
            child_stock,
            child_sockets,
            registry,
            sessions,
            logger,
        })
    }
}

/// 翻译驱动的请求调度器
pub struct Dispatcher {
    ctx: Arc<ProxyContext>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<ProxyContext>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.ctx
    }

    /// 对外入口: 任何失败都折成错误响应, 请求必有回应
    pub async fn handle(
        self: &Arc<Self>,
        mut req: RecvRequest,
        remote: Option<SocketAddr>,
    ) -> RecvResponse {
        let start = Instant::now();
        let method = req.method().to_string();
        let uri = req.path().clone();
        let host = header_value(req.headers(), "Host").unwrap_or_default();
        let referer = header_value(req.headers(), "Referer");
        let user_agent = header_value(req.headers(), "User-Agent");
        let bytes_received = req.body().origin_len() as u64;

        let result = self.handle_inner(&mut req, remote, &host).await;
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                log::warn!("{} {}: {}", method, uri, e);
                self.error_response(&e)
            }
        };

        let status = response.status().as_u16();
        let length = response.body().available().unwrap_or(0);
        self.ctx.logger.log(&AccessLogEntry {
            timestamp: std::time::SystemTime::now(),
            site: host,
            remote_host: remote.map(|v| v.ip().to_string()).unwrap_or_default(),
            method,
            uri,
            status,
            length,
            bytes_received,
            bytes_sent: length,
            duration: start.elapsed(),
            referer,
            user_agent,
        });
        response
    }

    fn verbose(&self) -> bool {
        self.ctx.config.verbose_response
    }

    /// 错误折算成响应: 超时 504, 准入 403, 编码 502 等
    pub fn error_response(&self, error: &ProtError) -> RecvResponse {
        let status = error.to_status();
        let body = if self.verbose() {
            format!("{}", error)
        } else {
            match status {
                403 => "Forbidden".to_string(),
                404 => "Not Found".to_string(),
                504 => "Gateway timeout".to_string(),
                _ => "Bad gateway".to_string(),
            }
        };
        Response::builder()
            .status(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .header("Content-Length", body.len().to_string())
            .body(Body::from(body))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }

    async fn handle_inner(
        self: &Arc<Self>,
        req: &mut RecvRequest,
        remote: Option<SocketAddr>,
        host: &str,
    ) -> ProtResult<RecvResponse> {
        let frame_args = parse_frame_args(req.url().query.as_deref());

        // 客户端的会话 cookie
        let session_id = self.extract_session(req);
        if let Some(id) = &session_id {
            self.ctx.sessions.with_session(id, |_| ());
        }

        let translate_request = self.build_translate_request(req, host, &session_id);
        let response = self.translate_loop(translate_request).await?;

        // 翻译的短路裁决
        if let Some(redirect) = &response.redirect {
            return Ok(Response::builder()
                .status(response.status.unwrap_or(302))
                .header("Location", redirect.clone())
                .body(Body::empty())
                .map_err(|e| ProtError::from(e))?);
        }
        if let Some(www_authenticate) = &response.www_authenticate {
            return Ok(Response::builder()
                .status(401)
                .header("WWW-Authenticate", www_authenticate.clone())
                .body(Body::empty())
                .map_err(|e| ProtError::from(e))?);
        }
        if let Some(message) = &response.message {
            let status = response.status.unwrap_or(200);
            return Ok(Response::builder()
                .status(status)
                .header("Content-Type", "text/plain; charset=utf-8")
                .body(Body::from(message.clone()))
                .map_err(|e| ProtError::from(e))?);
        }
        if matches!(response.address, ResourceAddress::None) {
            let status = response.status.unwrap_or(404);
            return Ok(Response::builder()
                .status(status)
                .body(Body::empty())
                .map_err(|e| ProtError::from(e))?);
        }

        // 代理模式: 聚焦部件的原始输出顶替整个响应
        if frame_args.raw {
            if let Some(focus) = &frame_args.focus {
                return self.proxy_widget(focus, &frame_args, host).await;
            }
        }

        let mut backend_response = self
            .fetch_with_cache(req, remote, host, &response)
            .await?;

        // 错误文档流程: 翻译列出的状态换成它给的文档
        let status = backend_response.status().as_u16();
        if response.error_document.contains(&status) {
            if let Ok(replacement) = self.fetch_error_document(req, host, status).await {
                backend_response = replacement;
            }
        }

        // 变换链
        let view = response
            .find_view(frame_args.view.as_deref())
            .cloned()
            .unwrap_or_default();
        backend_response = self
            .apply_transformations(backend_response, &view, &response, req, host, &frame_args)
            .await?;

        // 先探第一段响应体: 头发出去之前的错误还来得及折成错误页
        probe_first_chunk(&mut backend_response).await?;

        // 响应头与会话 cookie
        self.finish_response(&mut backend_response, &response, session_id);
        Ok(backend_response)
    }

    fn extract_session(&self, req: &RecvRequest) -> Option<SessionId> {
        let cookie = header_value(req.headers(), "Cookie")?;
        let name = &self.ctx.config.session.cookie_name;
        for part in cookie.split(';') {
            if let Some((n, v)) = part.trim().split_once('=') {
                if n.trim() == name {
                    return SessionId::parse(v.trim());
                }
            }
        }
        None
    }

    fn build_translate_request(
        &self,
        req: &RecvRequest,
        host: &str,
        session: &Option<SessionId>,
    ) -> TranslateRequest {
        let mut translate = TranslateRequest::new(req.path(), host);
        translate.user_agent = header_value(req.headers(), "User-Agent");
        translate.accept_language = header_value(req.headers(), "Accept-Language");
        translate.authorization = header_value(req.headers(), "Authorization");
        translate.session = session.map(|v| format!("{}", v));
        translate.remote_host = None;
        translate
    }

    /// CHECK 回环: 翻译提出追问就带着凭据再来, 回合有限
    async fn translate_loop(
        &self,
        mut request: TranslateRequest,
    ) -> ProtResult<TranslateResponse> {
        let mut rounds = 0;
        loop {
            let response = self.ctx.tcache.translate(&request).await?;
            match &response.check {
                Some(check) if rounds < Consts::MAX_CHECK_ROUNDS => {
                    rounds += 1;
                    request.check = Some(check.clone());
                }
                Some(_) => {
                    return Err(ProtError::Protocol("translation CHECK loop exceeded"));
                }
                None => return Ok(response),
            }
        }
    }

    async fn fetch_error_document(
        self: &Arc<Self>,
        req: &mut RecvRequest,
        host: &str,
        status: u16,
    ) -> ProtResult<RecvResponse> {
        let mut translate = TranslateRequest::new(req.path(), host);
        translate.error_document_status = Some(status);
        let response = self.ctx.tcache.translate(&translate).await?;
        let mut replacement = self
            .invoke_address(&response.address, req, host, true)
            .await?;
        // 文档换body, 状态保持后端原状
        let body = std::mem::replace(replacement.body_mut(), Body::empty());
        let mut out = Response::builder().status(status);
        for (name, value) in replacement.headers().iter() {
            out = out.header(name.to_string(), value.as_string().unwrap_or_default());
        }
        Ok(out.body(body).map_err(|e| ProtError::from(e))?)
    }

    /// 响应缓存编排: 命中直接回, 未命中者回源,
    /// 同指纹的并发请求挂到第一个回源者后面
    async fn fetch_with_cache(
        self: &Arc<Self>,
        req: &mut RecvRequest,
        remote: Option<SocketAddr>,
        host: &str,
        translate: &TranslateResponse,
    ) -> ProtResult<RecvResponse> {
        let method = req.method().to_string();
        if method != "GET" {
            // 非 GET 顺带做失效
            if !translate.invalidate.is_empty() {
                let snapshot = header_snapshot(req);
                self.ctx
                    .http_cache
                    .invalidate(&translate.invalidate, &|name| {
                        snapshot_lookup(&snapshot, name)
                    });
            }
            return self.fetch_backend(req, remote, host, translate).await;
        }

        if !translate.invalidate.is_empty() {
            let snapshot = header_snapshot(req);
            self.ctx
                .http_cache
                .invalidate(&translate.invalidate, &|name| {
                    snapshot_lookup(&snapshot, name)
                });
        }

        let key = CacheKey::new(&method, &format!("{}{}", host, req.path()));
        let snapshot = header_snapshot(req);

        loop {
            let lookup = self
                .ctx
                .http_cache
                .lookup(&key, &|name| snapshot_lookup(&snapshot, name));
            match lookup {
                CacheLookup::Hit(cached) => {
                    let mut builder = Response::builder().status(cached.status);
                    for (name, value) in &cached.headers {
                        builder = builder.header(name.clone(), value.clone());
                    }
                    return Ok(builder
                        .body(Body::only(cached.body))
                        .map_err(|e| ProtError::from(e))?);
                }
                CacheLookup::Wait(receiver) => {
                    let _ = receiver.await;
                    continue;
                }
                CacheLookup::Miss(guard) => {
                    let mut response = match self
                        .fetch_backend(req, remote, host, translate)
                        .await
                    {
                        Ok(v) => v,
                        Err(e) => {
                            guard.abandon();
                            return Err(e);
                        }
                    };
                    let status = response.status().as_u16();
                    let announced = response.body().available();
                    let small_enough = announced
                        .map(|v| v as usize <= self.ctx.http_cache.max_body_size())
                        .unwrap_or(true);
                    if !self.ctx.http_cache.is_cacheable(&method, status, 0) || !small_enough {
                        guard.abandon();
                        return Ok(response);
                    }
                    // 攒齐再存, 超限就放弃缓存改为透传
                    let mut buffer = BinaryMut::new();
                    match response.body_mut().read_all(&mut buffer).await {
                        Some(_) => {}
                        None => {
                            guard.abandon();
                            return Err(ProtError::Protocol("premature end of response"));
                        }
                    }
                    if buffer.remaining() > self.ctx.http_cache.max_body_size() {
                        guard.abandon();
                        let headers = collect_headers(&response);
                        let mut builder = Response::builder().status(status);
                        for (name, value) in headers {
                            builder = builder.header(name, value);
                        }
                        return Ok(builder
                            .body(Body::new_binary(buffer))
                            .map_err(|e| ProtError::from(e))?);
                    }
                    let body = buffer.freeze();
                    let headers = collect_headers(&response);
                    guard.complete(
                        translate.vary.clone(),
                        &|name| snapshot_lookup(&snapshot, name),
                        translate.max_age,
                        status,
                        headers.clone(),
                        body.clone(),
                    );
                    let mut builder = Response::builder().status(status);
                    for (name, value) in headers {
                        builder = builder.header(name, value);
                    }
                    return Ok(builder
                        .body(Body::only(body))
                        .map_err(|e| ProtError::from(e))?);
                }
            }
        }
    }

    /// 后端抓取, 带有限重试: 只有请求体未动时才敢重发
    async fn fetch_backend(
        self: &Arc<Self>,
        req: &mut RecvRequest,
        remote: Option<SocketAddr>,
        host: &str,
        translate: &TranslateResponse,
    ) -> ProtResult<RecvResponse> {
        let body_untouched = req.body().is_end() && req.body().origin_len() == 0;
        let max_attempts = if body_untouched { 3 } else { 1 };
        let mut attempt = 0;
        loop {
            attempt += 1;
            let forward = translate
                .request_header_forward
                .clone()
                .unwrap_or_else(|| self.ctx.config.request_forward.clone());
            let client_ip = remote.map(|v| v.ip().to_string());
            let trusted = client_ip
                .as_ref()
                .map(|ip| self.ctx.config.trusted_proxies.iter().any(|t| t == ip))
                .unwrap_or(false);
            let headers = forward::forward_request_headers(
                &forward,
                req.headers(),
                client_ip.as_deref(),
                trusted,
                &self.ctx.config.session.cookie_name,
            );

            let result = self
                .invoke_address_with_headers(&translate.address, req, host, headers, translate.transparent)
                .await;
            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    log::debug!("retrying backend after {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn invoke_address(
        self: &Arc<Self>,
        address: &ResourceAddress,
        req: &mut RecvRequest,
        host: &str,
        _internal: bool,
    ) -> ProtResult<RecvResponse> {
        self.invoke_address_with_headers(address, req, host, vec![], false)
            .await
    }

    /// 按地址类型分发到对应的协议客户端
    async fn invoke_address_with_headers(
        self: &Arc<Self>,
        address: &ResourceAddress,
        req: &mut RecvRequest,
        host: &str,
        headers: Vec<(String, String)>,
        transparent: bool,
    ) -> ProtResult<RecvResponse> {
        match address {
            ResourceAddress::None => Err(ProtError::Extension("no address")),
            ResourceAddress::Local(file) => static_file::serve_file(file).await,
            ResourceAddress::Nfs(nfs) => static_file::serve_nfs(nfs).await,
            ResourceAddress::Http(http) => {
                let lease = self
                    .ctx
                    .tcp_stock
                    .get(&http.address, &http.address)
                    .await?;
                let mut client = HttpClient::new(SocketLease::Tcp(lease));
                client.set_read_timeout(self.ctx.config.read_timeout);
                client.set_write_timeout(self.ctx.config.write_timeout);
                let backend_req =
                    self.build_backend_request(req, http, host, headers, transparent)?;
                client.request(backend_req).await
            }
            ResourceAddress::Ajp(http) => {
                let lease = self
                    .ctx
                    .tcp_stock
                    .get(&http.address, &http.address)
                    .await?;
                let mut client = AjpClient::new(SocketLease::Tcp(lease));
                client.set_read_timeout(self.ctx.config.read_timeout);
                client.set_write_timeout(self.ctx.config.write_timeout);
                let backend_req =
                    self.build_backend_request(req, http, host, headers, transparent)?;
                let info = AjpRequestInfo {
                    server_name: host.to_string(),
                    ..Default::default()
                };
                client.request(backend_req, info).await
            }
            ResourceAddress::Lhttp(child) => {
                let key = child.stock_key();
                self.configure_child(&key, child);
                let lease = self.ctx.child_sockets.get(&key, &key).await?;
                let mut client = HttpClient::new(SocketLease::Unix(lease));
                client.set_read_timeout(self.ctx.config.read_timeout);
                let http = HttpAddress {
                    address: host.to_string(),
                    host_header: Some(host.to_string()),
                    path: req.path().clone(),
                };
                let backend_req =
                    self.build_backend_request(req, &http, host, headers, transparent)?;
                client.request(backend_req).await
            }
            ResourceAddress::Cgi(child) | ResourceAddress::Pipe(child) => {
                let remote_addr = String::new();
                cgi::run_cgi(child, req, &remote_addr, host).await
            }
            ResourceAddress::Fastcgi(child) => {
                let key = child.stock_key();
                self.configure_child(&key, child);
                let lease = self.ctx.child_sockets.get(&key, &key).await?;
                let mut client = FcgiClient::new(SocketLease::Unix(lease));
                client.set_read_timeout(self.ctx.config.read_timeout);
                let backend_req = take_request(req, headers)?;
                let info = FcgiRequestInfo {
                    document_root: child.document_root.clone(),
                    script_filename: child.executable.clone(),
                    path_info: child.path_info.clone(),
                    server_name: host.to_string(),
                    server_port: 80,
                    ..Default::default()
                };
                client.request(backend_req, info).await
            }
            ResourceAddress::Was(child) => {
                let key = child.stock_key();
                self.configure_child(&key, child);
                let control = self.ctx.child_sockets.get(&key, &key).await?;
                // 数据通道独立建连, 不入池
                let path = self.ctx.child_stock.ensure(&key).await?;
                let data_path = format!("{}.data", path.display());
                let data = UnixStream::connect(&data_path)
                    .await
                    .map_err(ProtError::Connect)?;
                let client = WasClient::new(
                    SocketLease::Unix(control),
                    SocketLease::RawUnix(data),
                );
                let backend_req = take_request(req, headers)?;
                client.request(backend_req, child.parameters.clone()).await
            }
        }
    }

    fn configure_child(&self, key: &str, child: &ChildAddress) {
        self.ctx.child_stock.configure(
            key,
            ChildConfig {
                executable: child.executable.clone().into(),
                args: child.args.clone(),
                envs: child.envs.clone(),
                backlog: child.concurrency.max(1),
                jailed: child.jailed,
            },
        );
    }

    /// 组一个发往 HTTP/AJP 后端的请求
    fn build_backend_request(
        &self,
        req: &mut RecvRequest,
        http: &HttpAddress,
        host: &str,
        headers: Vec<(String, String)>,
        transparent: bool,
    ) -> ProtResult<Request<Body>> {
        let path = if transparent {
            req.path().clone()
        } else {
            let mut path = http.path.clone();
            if path.is_empty() {
                path = "/".to_string();
            }
            if let Some(query) = &req.url().query {
                if !path.contains('?') {
                    path.push('?');
                    path.push_str(query);
                }
            }
            path
        };
        let url = format!("http://{}{}", http.address, path);
        let method = req.method().to_string();
        let mut builder = Request::builder()
            .method(&*method)
            .url(&*url)
            .header(
                "Host",
                http.host_header.clone().unwrap_or_else(|| host.to_string()),
            );
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        let body = std::mem::replace(req.body_mut(), Body::empty());
        builder.body(body).map_err(|e| ProtError::from(e))
    }

    /// 代理模式: 聚焦部件的原始输出直接作为整个响应
    async fn proxy_widget(
        self: &Arc<Self>,
        focus: &str,
        frame_args: &FrameArgs,
        host: &str,
    ) -> ProtResult<RecvResponse> {
        // 路径末段是类别名或 id, 注册处按类别解析
        let class_name = focus.rsplit('/').next().unwrap_or(focus);
        let class = self.ctx.registry.resolve(class_name).await?;
        class.check_host(host)?;
        let path_info = frame_args.path.clone().unwrap_or_default();
        self.fetch(&class.address, &path_info, vec![]).await
    }

    /// 变换链: 组装, CSS, 文本, 过滤后端
    async fn apply_transformations(
        self: &Arc<Self>,
        mut response: RecvResponse,
        view: &View,
        translate: &TranslateResponse,
        req: &RecvRequest,
        host: &str,
        frame_args: &FrameArgs,
    ) -> ProtResult<RecvResponse> {
        for transformation in &view.transformations {
            match transformation {
                Transformation::Process { container } => {
                    if !is_html(&response) {
                        continue;
                    }
                    let env = self.build_processor_env(
                        translate,
                        req,
                        host,
                        frame_args,
                        *container,
                    );
                    let (tree, root) = WidgetTree::new_root("template");
                    let mut tree = tree;
                    tree.get_mut(root).class = Some(crate::WidgetClass {
                        address: translate.address.clone(),
                        views: translate.views.clone(),
                        container: *container,
                        stateful: translate.stateful,
                        untrusted_host: None,
                        untrusted_prefix: None,
                        untrusted_site_suffix: None,
                        approved_children: translate.approved_children.clone(),
                    });
                    let body = std::mem::replace(response.body_mut(), Body::empty());
                    let processed = Processor::process(body, env, tree, root);
                    response = rebuild_streaming(response, processed, "text/html; charset=utf-8")?;
                }
                Transformation::ProcessCss { rewrite_url } => {
                    if !*rewrite_url {
                        continue;
                    }
                    let env = self.build_processor_env(translate, req, host, frame_args, false);
                    let (tree, root) = WidgetTree::new_root("template");
                    let body = std::mem::replace(response.body_mut(), Body::empty());
                    let processed = CssProcessor::process(body, env, tree, Some(root));
                    response = rebuild_streaming(response, processed, "text/css")?;
                }
                Transformation::ProcessText => {
                    let env = self.build_processor_env(translate, req, host, frame_args, false);
                    let body = std::mem::replace(response.body_mut(), Body::empty());
                    let processed = TextProcessor::process(body, env);
                    response = rebuild_streaming(response, processed, "text/plain; charset=utf-8")?;
                }
                Transformation::Filter(address) => {
                    response = self.apply_filter(response, address, host).await?;
                }
            }
        }
        Ok(response)
    }

    /// FILTER: 当前响应体作为请求体再过一个后端
    async fn apply_filter(
        self: &Arc<Self>,
        mut response: RecvResponse,
        address: &ResourceAddress,
        host: &str,
    ) -> ProtResult<RecvResponse> {
        let body = std::mem::replace(response.body_mut(), Body::empty());
        match address {
            ResourceAddress::Pipe(child) => {
                let filtered = cgi::run_pipe(child, body).await?;
                rebuild_streaming(response, filtered, "application/octet-stream")
            }
            _ => {
                let mut filter_req: RecvRequest = Request::builder()
                    .method("POST")
                    .url(&*format!("http://{}/", host))
                    .body(body)
                    .map_err(|e| ProtError::from(e))?;
                self.invoke_address_with_headers(address, &mut filter_req, host, vec![], false)
                    .await
            }
        }
    }

    fn build_processor_env(
        self: &Arc<Self>,
        translate: &TranslateResponse,
        req: &RecvRequest,
        host: &str,
        frame_args: &FrameArgs,
        container: bool,
    ) -> Arc<ProcessorEnv> {
        let inline = Arc::new(InlineEnv {
            registry: self.ctx.registry.clone(),
            dispatch: self.clone(),
            host: host.to_string(),
            approved_children: translate.approved_children.clone(),
            container,
        });
        let external_uri = match req.path().split_once('?') {
            Some((p, _)) => p.to_string(),
            None => req.path().clone(),
        };
        let rewrite = RewriteEnv {
            external_uri: external_uri.clone(),
            args: frame_args.args.clone(),
            partition_domain: None,
            stateful: translate.stateful,
        };
        let context_values = vec![
            ("uri".to_string(), req.path().clone()),
            ("path".to_string(), frame_args.path.clone().unwrap_or_default()),
            ("frame".to_string(), frame_args.frame.clone().unwrap_or_default()),
            ("view".to_string(), frame_args.view.clone().unwrap_or_default()),
            ("base".to_string(), external_uri),
            ("args".to_string(), frame_args.args.clone().unwrap_or_default()),
        ];
        Arc::new(ProcessorEnv {
            inline,
            rewrite,
            context_values,
            context_widget: None,
            focus: frame_args.focus.clone(),
            focus_path_info: frame_args.path.clone(),
            rewrite_script: false,
        })
    }

    fn finish_response(
        &self,
        response: &mut RecvResponse,
        translate: &TranslateResponse,
        session_id: Option<SessionId>,
    ) {
        // 响应头按分组策略过一遍
        let settings = translate
            .response_header_forward
            .clone()
            .unwrap_or_else(|| self.ctx.config.response_forward.clone());
        let kept = forward::forward_response_headers(&settings, response);
        let names: Vec<String> = response
            .headers()
            .iter()
            .map(|(name, _)| name.to_string())
            .collect();
        for name in names {
            response.headers_mut().remove(&name);
        }
        for (name, value) in kept {
            response.headers_mut().insert(name, value);
        }

        // 需要会话而客户端还没有时补一个
        let wants_session = translate.session_cookie.is_some() || translate.stateful;
        if wants_session && session_id.is_none() {
            let id = self.ctx.sessions.create();
            let cookie = self.ctx.sessions.cookie_for(&id);
            response
                .headers_mut()
                .insert("Set-Cookie".to_string(), cookie);
        }
    }
}

/// 拉一段响应体再放回去, 让最早的失败在发头之前暴露
async fn probe_first_chunk(response: &mut RecvResponse) -> ProtResult<()> {
    let body = response.body_mut();
    if body.is_end() && body.origin_len() == 0 {
        return Ok(());
    }
    if body.origin_len() > 0 {
        return Ok(());
    }
    let (_, bin) = std::future::poll_fn(|cx| body.poll_data(cx)).await?;
    if bin.remaining() > 0 {
        body.cache_buffer(bin.chunk());
    }
    Ok(())
}

fn is_html(response: &RecvResponse) -> bool {
    response
        .headers()
        .get_option_value(&HeaderName::CONTENT_TYPE)
        .map(|v| {
            let v = v.as_string().unwrap_or_default().to_ascii_lowercase();
            v.starts_with("text/html") || v.starts_with("application/xhtml+xml")
        })
        .unwrap_or(false)
}

/// 换体重建响应: 原头照搬, 长度相关的头换成 chunked
fn rebuild_streaming(
    response: RecvResponse,
    body: Body,
    default_content_type: &str,
) -> ProtResult<RecvResponse> {
    let status = response.status().as_u16();
    let mut builder = Response::builder().status(status);
    let mut has_content_type = false;
    for (name, value) in response.headers().iter() {
        let lower = name.to_string().to_ascii_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" || lower == "content-encoding" {
            continue;
        }
        if lower == "content-type" {
            has_content_type = true;
        }
        builder = builder.header(name.to_string(), value.as_string().unwrap_or_default());
    }
    if !has_content_type {
        builder = builder.header("Content-Type", default_content_type.to_string());
    }
    builder.body(body).map_err(|e| ProtError::from(e))
}

fn collect_headers(response: &RecvResponse) -> Vec<(String, String)> {
    response
        .headers()
        .iter()
        .map(|(name, value)| (name.to_string(), value.as_string().unwrap_or_default()))
        .collect()
}

fn header_snapshot(req: &RecvRequest) -> Vec<(String, String)> {
    req.headers()
        .iter()
        .map(|(name, value)| (name.to_string().to_ascii_lowercase(), value.as_string().unwrap_or_default()))
        .collect()
}

fn snapshot_lookup(snapshot: &[(String, String)], name: &str) -> Option<String> {
    let lower = name.to_ascii_lowercase();
    snapshot
        .iter()
        .find(|(n, _)| n == &lower)
        .map(|(_, v)| v.clone())
}

fn take_request(req: &mut RecvRequest, headers: Vec<(String, String)>) -> ProtResult<Request<Body>> {
    let url = format!("http://backend{}", req.path());
    let method = req.method().to_string();
    let mut builder = Request::builder().method(&*method).url(&*url);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    let body = std::mem::replace(req.body_mut(), Body::empty());
    builder.body(body).map_err(|e| ProtError::from(e))
}

/// 部件子请求的出口实现
#[async_trait]
impl SubRequestDispatch for Dispatcher {
    async fn fetch(
        &self,
        address: &ResourceAddress,
        path_info: &str,
        headers: Vec<(String, String)>,
    ) -> ProtResult<RecvResponse> {
        let this = Dispatcher {
            ctx: self.ctx.clone(),
        };
        let this = Arc::new(this);
        let path = if path_info.is_empty() { "/" } else { path_info };
        let url = format!("http://widget{}", path);
        let mut builder = Request::builder().method("GET").url(&*url);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        let mut req: RecvRequest = builder
            .body(Body::empty())
            .map_err(|e| ProtError::from(e))?;
        this.invoke_address_with_headers(address, &mut req, "widget", vec![], false)
            .await
    }
}
