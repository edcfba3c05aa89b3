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
// Created Date: 2023/11/02 10:02:35

pub struct Consts;

impl Consts {
    pub const COMPRESS_METHOD_NONE: i8 = 0;
    pub const COMPRESS_METHOD_GZIP: i8 = 1;
    pub const COMPRESS_METHOD_DEFLATE: i8 = 2;
    pub const COMPRESS_METHOD_BROTLI: i8 = 3;

    /// 控制通道的魔数
    pub const CONTROL_MAGIC: u32 = 0x77676174;

    /// 访问日志数据报的魔数
    pub const LOG_MAGIC: u32 = 0x77676c67;

    /// 后端读写的默认超时
    pub const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 30;

    /// 内嵌部件等待响应头与响应体的期限
    pub const WIDGET_HEADER_TIMEOUT_SECS: u64 = 5;
    pub const WIDGET_BODY_TIMEOUT_SECS: u64 = 10;

    /// 翻译的 CHECK 回环上限, 超出则 502
    pub const MAX_CHECK_ROUNDS: usize = 4;

    /// 空闲子进程的清理间隔
    pub const CHILD_CLEAR_INTERVAL_SECS: u64 = 15 * 60;
    pub const CHILD_CLEAR_INTERVAL_JAIL_SECS: u64 = 5 * 60;

    /// 响应缓存体存储的压实周期
    pub const CACHE_COMPRESS_INTERVAL_SECS: u64 = 10 * 60;
}
