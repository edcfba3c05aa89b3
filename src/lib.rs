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
// Created Date: 2023/11/02 09:10:30

mod access_log;
mod body;
mod cache;
mod client;
mod config;
mod consts;
mod control;
mod dispatch;
mod error;
mod proc;
mod server;
mod session;
mod stock;
mod translate;
mod widget;

pub use access_log::{AccessLogEntry, AccessLogSink, AccessLogger};
pub use body::{
    html_escape, html_escape_str, Body, BodySource, BufferedBody, CatBody, CharsetBody,
    DelayedBody, DelayedSender, HoldBody, HoldHandle, HtmlEscapeBody, Replace, ReplaceBody,
    SubstBody, TimeoutBody,
};
pub use cache::{CacheKey, CacheLookup, CachedResponse, FetchGuard, HttpCache, Rubber};
pub use client::ajp::{AjpClient, AjpRequestInfo};
pub use client::fcgi::{FcgiClient, FcgiRequestInfo};
pub use client::{HttpClient, WasClient};
pub use config::{
    CacheConfig, ForwardMode, ForwardSettings, ProxyConfig, SessionConfig, StockConfig,
};
pub use consts::Consts;
pub use control::{ControlCommand, ControlServer};
pub use dispatch::{
    forward_request_headers, forward_response_headers, serve_file, serve_nfs, Dispatcher,
    ProxyContext,
};
pub use error::{ProtError, ProtResult, TimeoutError};
pub use proc::{CssProcessor, HtmlParser, Processor, ProcessorBody, ProcessorEnv, TextProcessor};
pub use server::{serve, Server};
pub use session::{Session, SessionId, SessionManager};
pub use stock::{
    ChildConfig, ChildSocketBuilder, ChildStock, Lease, SocketLease, Stock, StockBuilder,
    StockStats, TcpStockBuilder,
};
pub use translate::{
    expand_string, ChildAddress, FileAddress, HttpAddress, NfsAddress, ResourceAddress,
    TableOracle, TranslateCache, TranslateOracle, TranslateRequest, TranslateResponse,
    Transformation, View,
};
pub use widget::{
    rewrite_widget_uri, spawn_inline_widget, InlineEnv, InlineRequest, RewriteEnv, RewriteMode,
    SubRequestDispatch, Widget, WidgetClass, WidgetRef, WidgetRegistry, WidgetTree,
};

use webparse::{Request, Response};

pub type RecvRequest = Request<Body>;
pub type RecvResponse = Response<Body>;
