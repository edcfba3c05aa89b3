use std::{
    collections::HashMap,
    io,
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::{net::UnixStream, process::Child, process::Command};

use crate::{Consts, ProtError, ProtResult};

use super::StockBuilder;

/// 一个子进程后端的启动参数
#[derive(Clone, Debug)]
pub struct ChildConfig {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    /// 监听积压量, 与并发配置对齐
    pub backlog: u32,
    /// 受限环境下的子进程空闲期更短
    pub jailed: bool,
}

impl ChildConfig {
    pub fn clear_interval(&self) -> Duration {
        if self.jailed {
            Duration::from_secs(Consts::CHILD_CLEAR_INTERVAL_JAIL_SECS)
        } else {
            Duration::from_secs(Consts::CHILD_CLEAR_INTERVAL_SECS)
        }
    }
}

struct ChildState {
    process: Child,
    socket_path: PathBuf,
    config: ChildConfig,
    last_used: Instant,
}

/// 管理本机子进程后端: 按键启动并保活, 子进程各自监听一个
/// Unix 套接字, 连接由上层的连接池借还. 空闲过久的子进程被回收.
pub struct ChildStock {
    runtime_dir: PathBuf,
    inner: Mutex<ChildInner>,
}

struct ChildInner {
    configs: HashMap<String, ChildConfig>,
    children: HashMap<String, ChildState>,
}

impl ChildStock {
    pub fn new(runtime_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            runtime_dir,
            inner: Mutex::new(ChildInner {
                configs: HashMap::new(),
                children: HashMap::new(),
            }),
        })
    }

    /// 登记某个键的启动参数, 后续 get 按此启动
    pub fn configure(&self, key: &str, config: ChildConfig) {
        let mut inner = self.inner.lock().unwrap();
        inner.configs.insert(key.to_string(), config);
    }

    fn socket_path(&self, key: &str) -> PathBuf {
        // 键会包含路径分隔符之类, 简单散列成文件名
        let mut hash = 0u64;
        for b in key.as_bytes() {
            hash = hash.wrapping_mul(31).wrapping_add(*b as u64);
        }
        self.runtime_dir.join(format!("wmgate-child-{:016x}.sock", hash))
    }

    /// 确保子进程在跑, 返回其套接字路径
    pub async fn ensure(&self, key: &str) -> ProtResult<PathBuf> {
        let (path, need_spawn, config) = {
            let mut inner = self.inner.lock().unwrap();
            let config = match inner.configs.get(key) {
                Some(v) => v.clone(),
                None => return Err(ProtError::Config(format!("no child config for {}", key))),
            };
            let state = match inner.children.get_mut(key) {
                Some(state) => {
                    state.last_used = Instant::now();
                    let dead = state.process.try_wait().ok().flatten().is_some();
                    Some((state.socket_path.clone(), dead))
                }
                None => None,
            };
            match state {
                Some((_, true)) => {
                    inner.children.remove(key);
                    (self.socket_path(key), true, config)
                }
                Some((path, false)) => (path, false, config),
                None => (self.socket_path(key), true, config),
            }
        };

        if need_spawn {
            self.spawn(key, &path, config).await?;
        }
        Ok(path)
    }

    async fn spawn(&self, key: &str, path: &PathBuf, config: ChildConfig) -> ProtResult<()> {
        let _ = tokio::fs::remove_file(path).await;
        let mut command = Command::new(&config.executable);
        command
            .args(&config.args)
            .env("WMGATE_SOCKET", path)
            .env("WMGATE_BACKLOG", config.backlog.to_string())
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (k, v) in &config.envs {
            command.env(k, v);
        }
        let child = command.spawn().map_err(|e| ProtError::Connect(e))?;
        log::info!("spawned child for {} at {:?}", key, path);

        // 等子进程把套接字立起来
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if tokio::fs::metadata(path).await.is_ok() {
                break;
            }
            if Instant::now() > deadline {
                return Err(ProtError::connect_timeout("child socket"));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut inner = self.inner.lock().unwrap();
        inner.children.insert(
            key.to_string(),
            ChildState {
                process: child,
                socket_path: path.clone(),
                config,
                last_used: Instant::now(),
            },
        );
        Ok(())
    }

    /// 回收空闲过久或已退出的子进程
    pub fn expire(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let mut stale: Vec<String> = Vec::new();
        for (k, s) in inner.children.iter_mut() {
            if s.process.try_wait().ok().flatten().is_some()
                || now.duration_since(s.last_used) > s.config.clear_interval()
            {
                stale.push(k.clone());
            }
        }
        for key in stale {
            if let Some(mut state) = inner.children.remove(&key) {
                log::info!("expire child for {}", key);
                let _ = state.process.start_kill();
            }
        }
    }

    /// 全部杀掉, 对应控制命令 TERMINATE_CHILDREN
    pub fn terminate_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for (key, mut state) in inner.children.drain() {
            log::info!("terminate child for {}", key);
            let _ = state.process.start_kill();
        }
    }

    pub fn running(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.children.len()
    }
}

/// 子进程连接池的构造器: 先保证子进程存活, 再对其套接字建连
pub struct ChildSocketBuilder {
    children: Arc<ChildStock>,
}

impl ChildSocketBuilder {
    pub fn new(children: Arc<ChildStock>) -> Self {
        Self { children }
    }
}

#[async_trait]
impl StockBuilder for ChildSocketBuilder {
    type Item = UnixStream;

    async fn build(&self, key: &str) -> ProtResult<Self::Item> {
        let path = self.children.ensure(key).await?;
        UnixStream::connect(&path)
            .await
            .map_err(|e| ProtError::Connect(e))
    }

    fn check(&self, item: &mut Self::Item) -> bool {
        let mut buf = [0u8; 1];
        match item.try_read(&mut buf) {
            Ok(_) => false,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }
}
