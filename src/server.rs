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
// Created Date: 2023/12/18 09:05:12

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use webparse::{BinaryMut, Buf, Helper, Request};

use crate::{
    client::read_some, Consts, Dispatcher, ProtError, ProtResult, ProxyContext, Body, RecvRequest,
};

/// 前端服务: 接客户端连接, 驱动调度器, 按 keep-alive 续用连接
pub struct Server {
    dispatcher: Arc<Dispatcher>,
}

impl Server {
    pub fn new(ctx: Arc<ProxyContext>) -> Self {
        Self {
            dispatcher: Dispatcher::new(ctx),
        }
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// 监听循环, 顺带挂上周期性的清理任务
    pub async fn run(self, listener: TcpListener) -> ProtResult<()> {
        let ctx = self.dispatcher.context().clone();
        crate::HttpCache::spawn_compress_timer(ctx.http_cache.clone());
        {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    ctx.sessions.cleanup();
                    ctx.child_stock.expire();
                }
            });
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(dispatcher, stream, addr).await {
                    log::debug!("connection {} closed: {}", addr, e);
                }
            });
        }
    }

    /// 一条连接上的请求循环
    pub async fn handle_connection(
        dispatcher: Arc<Dispatcher>,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> ProtResult<()> {
        let mut read_buf = BinaryMut::new();
        loop {
            let req = match Self::read_request(&mut stream, &mut read_buf).await? {
                Some(v) => v,
                None => return Ok(()),
            };
            let keep_alive = req.is_keep_alive();
            let response = dispatcher.handle(req, Some(addr)).await;
            let clean = Self::write_response(&mut stream, response).await?;
            if !keep_alive || !clean {
                return Ok(());
            }
        }
    }

    /// 读一个完整请求; 对端在边界处关闭返回 None
    async fn read_request(
        stream: &mut TcpStream,
        read_buf: &mut BinaryMut,
    ) -> ProtResult<Option<RecvRequest>> {
        let mut got_any = read_buf.remaining() > 0;
        let (mut request, size) = loop {
            if read_buf.remaining() > 0 {
                let mut request = Request::new();
                match request.parse_buffer(&mut read_buf.clone()) {
                    Ok(size) => {
                        if !request.is_partial() {
                            break (request, size);
                        }
                    }
                    Err(e) => {
                        if !e.is_partial() {
                            return Err(e.into());
                        }
                    }
                }
            }
            let n = match tokio::time::timeout(
                Duration::from_secs(Consts::DEFAULT_BACKEND_TIMEOUT_SECS),
                read_some(stream, read_buf),
            )
            .await
            {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(ProtError::read_timeout("client")),
            };
            if n == 0 {
                if got_any && read_buf.remaining() > 0 {
                    return Err(ProtError::Protocol("premature close in request"));
                }
                return Ok(None);
            }
            got_any = true;
        };
        read_buf.advance(size);

        // 请求体攒齐再交给调度, 长度以头为准
        let body_len = request.get_body_len();
        let mut body_buf = BinaryMut::new();
        if body_len > 0 {
            let expect = body_len as usize;
            loop {
                let take = std::cmp::min(expect - body_buf.remaining(), read_buf.remaining());
                body_buf.put_slice(&read_buf.chunk()[..take]);
                read_buf.advance(take);
                if body_buf.remaining() >= expect {
                    break;
                }
                let n = read_some(stream, read_buf).await?;
                if n == 0 {
                    return Err(ProtError::Protocol("premature close in request body"));
                }
            }
        }
        let (request, _) = request.into(Body::new_binary(body_buf));
        Ok(Some(request))
    }

    /// 写响应; 返回连接是否仍然干净可续用
    async fn write_response(
        stream: &mut TcpStream,
        mut response: crate::RecvResponse,
    ) -> ProtResult<bool> {
        let mut body = std::mem::replace(response.body_mut(), Body::empty());
        let known_len = body.available();
        let chunked = match known_len {
            Some(len) => {
                response
                    .headers_mut()
                    .insert("Content-Length".to_string(), len.to_string());
                false
            }
            None => {
                response
                    .headers_mut()
                    .insert("Transfer-Encoding".to_string(), "chunked".to_string());
                true
            }
        };

        let mut out = BinaryMut::new();
        response.encode_header(&mut out)?;
        stream.write_all(out.chunk()).await?;

        let mut sent_any = false;
        loop {
            let next = std::future::poll_fn(|cx| body.poll_data(cx)).await;
            match next {
                Ok((is_end, bin)) => {
                    if bin.remaining() > 0 {
                        sent_any = true;
                        if chunked {
                            let mut framed = BinaryMut::new();
                            Helper::encode_chunk_data(&mut framed, bin.chunk())?;
                            stream.write_all(framed.chunk()).await?;
                        } else {
                            stream.write_all(bin.chunk()).await?;
                        }
                    }
                    if is_end {
                        if chunked {
                            let mut framed = BinaryMut::new();
                            Helper::encode_chunk_data(&mut framed, &[])?;
                            stream.write_all(framed.chunk()).await?;
                        }
                        return Ok(true);
                    }
                }
                Err(e) => {
                    // 头已经出去了, 只能掐断连接让客户端看出异常
                    log::warn!("response body failed: {}", e);
                    let _ = sent_any;
                    let _ = stream.shutdown().await;
                    return Ok(false);
                }
            }
        }
    }
}

/// 方便测试与简单部署: 绑地址即服务
pub async fn serve(ctx: Arc<ProxyContext>, addr: &str) -> ProtResult<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let server = Server::new(ctx);
    tokio::spawn(async move {
        if let Err(e) = server.run(listener).await {
            log::error!("server loop failed: {}", e);
        }
    });
    Ok(local)
}
