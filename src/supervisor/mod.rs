//! 商户进程监管
//!
//! 启动子进程后按指数退避轮询健康探测，直到就绪或启动超时；超时则杀掉子进程并报
//! ProcessStartupFailure。stop() 只生效一次：先发 SIGTERM，等待宽限期，仍未退出则强杀。
//! 子进程的 stdout / stderr 持续读出并转发到 tracing（target = "merchant"）。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{AppConfig, SupervisorSection};
use crate::core::AgentError;
use crate::protocol::ProtocolClient;

/// 就绪探测
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> Result<(), String>;
}

/// 以单次 discover 作为健康探测
pub struct ManifestProbe {
    client: ProtocolClient,
    timeout: Duration,
}

impl ManifestProbe {
    pub fn new(client: ProtocolClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl HealthCheck for ManifestProbe {
    async fn check(&self) -> Result<(), String> {
        self.client
            .probe(self.timeout)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// 要启动的程序
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// 商户服务进程：未配置 program 时取与当前可执行文件同目录的 shopbee-merchant；
    /// 监听地址、目录与协议版本经 SHOPBEE__MERCHANT__* 环境变量传给子进程
    pub fn merchant(cfg: &AppConfig) -> Result<Self, AgentError> {
        let program = match &cfg.merchant.program {
            Some(p) => p.clone(),
            None => {
                let exe = std::env::current_exe()
                    .map_err(|e| AgentError::ConfigError(format!("cannot locate executable: {e}")))?;
                let dir = exe.parent().ok_or_else(|| {
                    AgentError::ConfigError("executable has no parent directory".to_string())
                })?;
                dir.join(format!("shopbee-merchant{}", std::env::consts::EXE_SUFFIX))
            }
        };

        let mut spec = Self::new(program)
            .env("SHOPBEE__MERCHANT__HOST", cfg.merchant.host.clone())
            .env("SHOPBEE__MERCHANT__PORT", cfg.merchant.port.to_string())
            .env(
                "SHOPBEE__MERCHANT__PROTOCOL_VERSION",
                cfg.merchant.protocol_version.clone(),
            );
        if let Some(catalog) = &cfg.merchant.catalog_path {
            let catalog = absolutize(catalog)?;
            spec = spec.env(
                "SHOPBEE__MERCHANT__CATALOG_PATH",
                catalog.to_string_lossy().into_owned(),
            );
        }
        Ok(spec)
    }
}

/// 启动 / 停止的时间参数
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub startup_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub grace_period: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&SupervisorSection::default())
    }
}

impl From<&SupervisorSection> for SupervisorSettings {
    fn from(cfg: &SupervisorSection) -> Self {
        Self {
            startup_timeout: Duration::from_millis(cfg.startup_timeout_ms),
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms.max(cfg.initial_backoff_ms)),
            grace_period: Duration::from_millis(cfg.grace_period_ms),
        }
    }
}

fn absolutize(path: &Path) -> Result<PathBuf, AgentError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir()
        .map_err(|e| AgentError::ConfigError(format!("cannot read current directory: {e}")))?;
    Ok(cwd.join(path))
}

/// 解析为绝对路径：带目录的相对路径相对 cwd，裸命令名在 PATH 中查找
fn resolve_program(program: &Path) -> Result<PathBuf, AgentError> {
    if program.is_absolute() {
        return Ok(program.to_path_buf());
    }
    if program.components().count() > 1 {
        return absolutize(program);
    }
    let found = std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    });
    match found {
        Some(path) => Ok(path),
        None => absolutize(program),
    }
}

fn drain<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if stream == "stderr" => {
                    tracing::warn!(target: "merchant", stream, "{}", line)
                }
                Ok(Some(line)) => tracing::debug!(target: "merchant", stream, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(target: "merchant", stream, "output closed: {}", e);
                    break;
                }
            }
        }
    });
}

/// 子进程监管器
pub struct ProcessSupervisor {
    spec: ProcessSpec,
    settings: SupervisorSettings,
    health: Arc<dyn HealthCheck>,
    child: Mutex<Option<Child>>,
    /// 最近一次启动的 pid（0 表示从未启动）
    last_pid: AtomicU32,
    stopped: AtomicBool,
}

impl ProcessSupervisor {
    pub fn new(spec: ProcessSpec, settings: SupervisorSettings, health: Arc<dyn HealthCheck>) -> Self {
        Self {
            spec,
            settings,
            health,
            child: Mutex::new(None),
            last_pid: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// 最近一次启动的子进程 pid；进程可能已退出
    pub fn pid(&self) -> Option<u32> {
        match self.last_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// 启动子进程并阻塞到健康探测通过
    pub async fn start(&self) -> Result<(), AgentError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(AgentError::ProcessStartupFailure(
                "supervisor already stopped".to_string(),
            ));
        }
        {
            let mut guard = self.child.lock().await;
            if guard.is_some() {
                return Ok(());
            }
            let program = resolve_program(&self.spec.program)?;
            let mut child = Command::new(&program)
                .args(&self.spec.args)
                .envs(self.spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    AgentError::ProcessStartupFailure(format!(
                        "failed to spawn {}: {}",
                        program.display(),
                        e
                    ))
                })?;

            if let Some(stdout) = child.stdout.take() {
                drain(stdout, "stdout");
            }
            if let Some(stderr) = child.stderr.take() {
                drain(stderr, "stderr");
            }
            let pid = child.id().unwrap_or(0);
            self.last_pid.store(pid, Ordering::SeqCst);
            tracing::info!(program = %program.display(), pid, "merchant process spawned");
            *guard = Some(child);
        }

        match self.wait_ready().await {
            Ok(elapsed) => {
                tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "merchant process ready");
                Ok(())
            }
            Err(reason) => {
                tracing::error!("merchant startup failed: {}", reason);
                self.kill_now().await;
                Err(AgentError::ProcessStartupFailure(reason))
            }
        }
    }

    /// 指数退避轮询健康探测
    async fn wait_ready(&self) -> Result<Duration, String> {
        let started = Instant::now();
        let deadline = started + self.settings.startup_timeout;
        let mut backoff = self.settings.initial_backoff;
        let mut last_error = "no health check attempted".to_string();

        loop {
            self.ensure_running().await?;
            match self.health.check().await {
                // 探测期间可能已被 stop()，确认子进程仍在
                Ok(()) => return self.ensure_running().await.map(|()| started.elapsed()),
                Err(e) => {
                    tracing::debug!(backoff_ms = backoff.as_millis() as u64, "merchant not ready: {}", e);
                    last_error = e;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(format!(
                    "not healthy within {:?}: {}",
                    self.settings.startup_timeout, last_error
                ));
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(self.settings.max_backoff);
        }
    }

    /// 启动期间子进程已退出或已被 stop() 取走时立即失败
    async fn ensure_running(&self) -> Result<(), String> {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            None => Err("process was stopped during startup".to_string()),
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => Err(format!("process exited during startup ({status})")),
                _ => Ok(()),
            },
        }
    }

    async fn kill_now(&self) {
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                tracing::warn!("failed to kill merchant process: {}", e);
            }
        }
    }

    /// 子进程仍在运行且健康探测通过
    pub async fn is_healthy(&self) -> bool {
        {
            let mut guard = self.child.lock().await;
            match guard.as_mut() {
                Some(child) => {
                    if !matches!(child.try_wait(), Ok(None)) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        self.health.check().await.is_ok()
    }

    /// 停止子进程；多次调用只有第一次生效
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return;
        };

        if self.terminate(&mut child).await {
            return;
        }

        match child.kill().await {
            Ok(()) => tracing::info!("merchant process killed"),
            Err(e) => tracing::warn!("failed to kill merchant process: {}", e),
        }
    }
}

impl ProcessSupervisor {
    /// SIGTERM 后在宽限期内等待退出；返回子进程是否已退出
    #[cfg(unix)]
    async fn terminate(&self, child: &mut Child) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = child.id() else {
            return false;
        };
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!(pid, "SIGTERM failed: {}", e);
            return false;
        }
        match tokio::time::timeout(self.settings.grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(pid, %status, "merchant process stopped");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(pid, "waiting for merchant failed: {}", e);
                false
            }
            Err(_) => {
                tracing::warn!(
                    pid,
                    "merchant ignored SIGTERM for {:?}, killing",
                    self.settings.grace_period
                );
                false
            }
        }
    }

    #[cfg(not(unix))]
    async fn terminate(&self, _child: &mut Child) -> bool {
        false
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(child) = self.child.get_mut().as_mut() {
            let _ = child.start_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_program_is_absolute() {
        assert!(resolve_program(Path::new("./bin/merchant")).unwrap().is_absolute());
        assert!(resolve_program(Path::new("/usr/bin/env")).unwrap().is_absolute());
        #[cfg(unix)]
        assert!(resolve_program(Path::new("sh")).unwrap().is_absolute());
    }

    #[test]
    fn test_merchant_spec_passes_env() {
        let mut cfg = AppConfig::default();
        cfg.merchant.program = Some(PathBuf::from("/opt/shopbee-merchant"));
        cfg.merchant.port = 9100;
        cfg.merchant.catalog_path = Some(PathBuf::from("catalog.toml"));
        let spec = ProcessSpec::merchant(&cfg).unwrap();

        assert_eq!(spec.program, PathBuf::from("/opt/shopbee-merchant"));
        let env = |k: &str| {
            spec.envs
                .iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(env("SHOPBEE__MERCHANT__PORT").as_deref(), Some("9100"));
        assert!(Path::new(&env("SHOPBEE__MERCHANT__CATALOG_PATH").unwrap()).is_absolute());
    }

    #[test]
    fn test_settings_from_config() {
        let settings = SupervisorSettings::default();
        assert_eq!(settings.startup_timeout, Duration::from_secs(10));
        assert_eq!(settings.initial_backoff, Duration::from_millis(100));
        assert_eq!(settings.max_backoff, Duration::from_secs(2));
        assert_eq!(settings.grace_period, Duration::from_secs(5));
    }
}
