//! 商户进程监管：启动超时清理、就绪、幂等停止、大量输出、真实商户进程
#![cfg(unix)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use shopbee::config::AppConfig;
use shopbee::core::AgentError;
use shopbee::merchant::REQUIRED_CAPABILITIES;
use shopbee::protocol::{verify_manifest, Backoff, CommerceApi, ProtocolClient, RetryPolicy};
use shopbee::supervisor::{
    HealthCheck, ManifestProbe, ProcessSpec, ProcessSupervisor, SupervisorSettings,
};

/// 前 fail_first 次探测失败，之后成功
struct CountingHealth {
    calls: AtomicUsize,
    fail_first: usize,
}

impl CountingHealth {
    fn healthy_after(fail_first: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_first,
        })
    }

    fn never() -> Arc<Self> {
        Self::healthy_after(usize::MAX)
    }
}

#[async_trait]
impl HealthCheck for CountingHealth {
    async fn check(&self) -> Result<(), String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            Err(format!("check {n} refused"))
        } else {
            Ok(())
        }
    }
}

/// 子进程创建标记文件后才算就绪
struct MarkerHealth(PathBuf);

#[async_trait]
impl HealthCheck for MarkerHealth {
    async fn check(&self) -> Result<(), String> {
        if self.0.exists() {
            Ok(())
        } else {
            Err(format!("{} not created yet", self.0.display()))
        }
    }
}

fn settings(startup_ms: u64) -> SupervisorSettings {
    SupervisorSettings {
        startup_timeout: Duration::from_millis(startup_ms),
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(100),
        grace_period: Duration::from_secs(2),
    }
}

fn process_exists(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[tokio::test]
async fn test_startup_timeout_kills_child() {
    let health = CountingHealth::never();
    let supervisor = ProcessSupervisor::new(
        ProcessSpec::new("sleep").arg("30"),
        settings(400),
        health.clone(),
    );

    let started = Instant::now();
    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, AgentError::ProcessStartupFailure(_)), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    // 退避期间探测了多次
    assert!(health.calls.load(Ordering::SeqCst) >= 2);

    let pid = supervisor.pid().expect("child was spawned");
    assert!(!process_exists(pid), "child {pid} still running after startup failure");
    assert!(!supervisor.is_healthy().await);
}

#[tokio::test]
async fn test_start_then_idempotent_stop() {
    let supervisor = ProcessSupervisor::new(
        ProcessSpec::new("sleep").arg("30"),
        settings(2_000),
        CountingHealth::healthy_after(2),
    );

    supervisor.start().await.unwrap();
    let pid = supervisor.pid().unwrap();
    assert!(process_exists(pid));
    assert!(supervisor.is_healthy().await);

    let started = Instant::now();
    supervisor.stop().await;
    // sleep 响应 SIGTERM，不需要等满宽限期
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!process_exists(pid));
    assert!(!supervisor.is_healthy().await);

    supervisor.stop().await;
    assert!(matches!(
        supervisor.start().await,
        Err(AgentError::ProcessStartupFailure(_))
    ));
}

#[tokio::test]
async fn test_child_exiting_early_fails_fast() {
    let supervisor = ProcessSupervisor::new(
        ProcessSpec::new("true"),
        settings(5_000),
        CountingHealth::never(),
    );
    let started = Instant::now();
    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, AgentError::ProcessStartupFailure(msg) if msg.contains("exited")));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_missing_program_is_startup_failure() {
    let supervisor = ProcessSupervisor::new(
        ProcessSpec::new("/nonexistent/shopbee-merchant"),
        settings(500),
        CountingHealth::healthy_after(0),
    );
    assert!(matches!(
        supervisor.start().await,
        Err(AgentError::ProcessStartupFailure(_))
    ));
    assert!(supervisor.pid().is_none());
}

#[tokio::test]
async fn test_stop_during_startup_fails_fast() {
    let supervisor = Arc::new(ProcessSupervisor::new(
        ProcessSpec::new("sleep").arg("30"),
        settings(10_000),
        CountingHealth::never(),
    ));
    let starting = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.start().await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    supervisor.stop().await;
    let err = tokio::time::timeout(Duration::from_secs(3), starting)
        .await
        .expect("start() kept polling after stop()")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, AgentError::ProcessStartupFailure(msg) if msg.contains("stopped")));
    assert!(started.elapsed() < Duration::from_secs(3));

    let pid = supervisor.pid().unwrap();
    assert!(!process_exists(pid));
}

#[tokio::test]
async fn test_chatty_child_does_not_block_on_full_pipes() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ready");
    // 远超管道缓冲区的 stdout / stderr 输出之后才创建就绪标记
    let script = format!(
        "yes merchant-stdout-line | head -n 400000; \
         yes merchant-stderr-line | head -n 400000 >&2; \
         touch '{}'; exec sleep 30",
        marker.display()
    );
    let supervisor = ProcessSupervisor::new(
        ProcessSpec::new("sh").arg("-c").arg(script),
        settings(20_000),
        Arc::new(MarkerHealth(marker.clone())),
    );

    supervisor.start().await.unwrap();
    assert!(marker.exists());
    let pid = supervisor.pid().unwrap();
    assert!(process_exists(pid));

    supervisor.stop().await;
    assert!(!process_exists(pid));
}

#[tokio::test]
async fn test_real_merchant_process_lifecycle() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut cfg = AppConfig::default();
    cfg.merchant.program = Some(PathBuf::from(env!("CARGO_BIN_EXE_shopbee-merchant")));
    cfg.merchant.host = "127.0.0.1".to_string();
    cfg.merchant.port = port;

    let policy = RetryPolicy {
        timeout: Duration::from_millis(500),
        max_retries: 0,
        base_delay: Duration::from_millis(10),
        backoff: Backoff::Fixed,
    };
    let client = ProtocolClient::new(&cfg.merchant.base_url(), policy).unwrap();
    let health = ManifestProbe::new(client.clone(), Duration::from_millis(500));
    let supervisor = ProcessSupervisor::new(
        ProcessSpec::merchant(&cfg).unwrap(),
        settings(15_000),
        Arc::new(health),
    );

    supervisor.start().await.unwrap();
    assert!(supervisor.is_healthy().await);
    verify_manifest(&client, REQUIRED_CAPABILITIES).await.unwrap();
    assert_eq!(client.get_product("prod-1").await.unwrap().name, "USB Cable");

    let pid = supervisor.pid().unwrap();
    supervisor.stop().await;
    assert!(!process_exists(pid));
    assert!(matches!(
        client.discover().await,
        Err(AgentError::UpstreamUnavailable(_))
    ));
}
