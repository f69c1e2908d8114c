//! shopbee - 命令行购物助手
//!
//! 入口：加载配置、初始化日志、拉起商户服务子进程并等待就绪、校验 manifest、
//! 建立检索索引，然后进入 stdin 对话循环。Ctrl+C / SIGTERM / EOF 都会走同一套清理：
//! 停止会话清扫、停止商户进程。

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use shopbee::agent::Agent;
use shopbee::config::{load_config, AppConfig};
use shopbee::core::{FnCleanup, ShutdownCoordinator, ShutdownManager, SupervisorCleanup};
use shopbee::llm::{create_embedder_from_config, create_llm_from_config};
use shopbee::merchant::REQUIRED_CAPABILITIES;
use shopbee::observability;
use shopbee::protocol::{verify_manifest, CommerceApi, ProtocolClient};
use shopbee::retrieval::{EmbeddingIndex, Retriever, VectorIndex};
use shopbee::supervisor::{ManifestProbe, ProcessSpec, ProcessSupervisor, SupervisorSettings};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

const GREETING: &str = "shopbee ready. Ask me to find products, buy one, show your cart, or check out. Type \"quit\" to exit.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load configuration")?;

    let client = ProtocolClient::new(&cfg.merchant.base_url(), cfg.client.retry_policy())
        .context("Invalid merchant address")?;
    let probe = ManifestProbe::new(
        client.clone(),
        Duration::from_millis(cfg.supervisor.probe_timeout_ms),
    );
    let spec = ProcessSpec::merchant(&cfg).context("Cannot locate merchant program")?;
    let supervisor = Arc::new(ProcessSupervisor::new(
        spec,
        SupervisorSettings::from(&cfg.supervisor),
        Arc::new(probe),
    ));

    let manager = Arc::new(ShutdownManager::new());
    manager.install_signal_handlers();

    let sweeper_token = CancellationToken::new();
    // 宽限期之外再留出强杀与回收的时间
    let mut coordinator =
        ShutdownCoordinator::new().with_timeout(cfg.supervisor.grace_period_ms / 1000 + 5);
    let token = sweeper_token.clone();
    coordinator.register(FnCleanup::new("SessionSweeper", move || token.cancel()));
    coordinator.register(SupervisorCleanup::new(supervisor.clone()));

    let outcome = tokio::select! {
        res = run(&cfg, client, &supervisor, sweeper_token) => res,
        _ = manager.wait_for_shutdown() => {
            tracing::info!("Shutdown signal received");
            Ok(())
        }
    };

    coordinator.run_cleanup().await;
    if let Err(e) = &outcome {
        tracing::error!("shopbee exited with error: {:#}", e);
    }
    outcome
}

async fn run(
    cfg: &AppConfig,
    client: ProtocolClient,
    supervisor: &ProcessSupervisor,
    sweeper_token: CancellationToken,
) -> anyhow::Result<()> {
    supervisor
        .start()
        .await
        .context("Merchant service failed to start")?;

    let api: Arc<dyn CommerceApi> = Arc::new(client);
    verify_manifest(api.as_ref(), REQUIRED_CAPABILITIES)
        .await
        .context("Merchant manifest check failed")?;

    let embedding_index = create_embedder_from_config(
        cfg.llm.embedding_base_url.as_deref(),
        &cfg.llm.embedding_model,
        None,
    )
    .map(|embedder| Arc::new(EmbeddingIndex::new(embedder)));
    let index = embedding_index
        .clone()
        .map(|i| i as Arc<dyn VectorIndex>);
    let retriever = Arc::new(Retriever::new(index, Vec::new()).with_config(&cfg.retrieval));

    let products = retriever
        .refresh_catalog(api.as_ref())
        .await
        .context("Failed to load merchant catalog")?;
    tracing::info!(products, "catalog loaded");

    match &embedding_index {
        Some(index) => match index.index_catalog(&retriever.catalog().await).await {
            Ok(indexed) => tracing::info!(indexed, "semantic index built"),
            Err(e) => tracing::warn!("semantic index unavailable, keyword search only: {}", e),
        },
        None => tracing::info!("no embedding provider configured, keyword search only"),
    }

    let llm = create_llm_from_config(cfg);
    let agent = Agent::from_config(cfg, api, retriever, llm.clone());
    let sweeper = agent.sessions().spawn_sweeper(
        Duration::from_secs(cfg.session.sweep_interval_secs.max(1)),
        sweeper_token,
    );

    let result = repl(&agent, &cfg.app.conversation_id).await;
    sweeper.abort();
    if let Some(llm) = &llm {
        let (prompt_tokens, completion_tokens, total_tokens) = llm.token_usage();
        tracing::info!(prompt_tokens, completion_tokens, total_tokens, "LLM token usage");
    }
    result
}

async fn repl(agent: &Agent, conversation_id: &str) -> anyhow::Result<()> {
    println!("{GREETING}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        std::io::stdout().flush().context("Failed to write prompt")?;

        let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
            println!();
            break;
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if matches!(text, "quit" | "exit" | "/quit") {
            break;
        }

        let turn = agent.handle_turn(conversation_id, text).await;
        println!("shopbee> {}", turn.reply);
    }
    Ok(())
}
