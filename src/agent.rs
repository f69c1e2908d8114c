//! 对话 Agent 运行时
//!
//! 每轮：取得会话的轮次闸门 -> 载入（或新建）会话 -> 从会话播种 AgentState ->
//! 跑工作流 -> 写回会话。同一会话的轮次按到达顺序串行，不同会话互不阻塞。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::AppConfig;
use crate::llm::LlmClient;
use crate::protocol::CommerceApi;
use crate::retrieval::Retriever;
use crate::session::SessionManager;
use crate::workflow::{AgentState, Intent, WorkflowEngine};

/// 单轮处理结果
#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub session_id: String,
    pub reply: String,
    pub intent: Intent,
    /// 本轮检索走了关键词兜底
    pub degraded: bool,
}

pub struct Agent {
    sessions: Arc<SessionManager>,
    engine: WorkflowEngine,
}

impl Agent {
    pub fn new(sessions: Arc<SessionManager>, engine: WorkflowEngine) -> Self {
        Self { sessions, engine }
    }

    /// 按配置组装工作流引擎与会话管理器
    pub fn from_config(
        cfg: &AppConfig,
        api: Arc<dyn CommerceApi>,
        retriever: Arc<Retriever>,
        llm: Option<Arc<dyn LlmClient>>,
    ) -> Self {
        let engine = WorkflowEngine::new(api, retriever, llm)
            .with_top_k(cfg.retrieval.top_k)
            .with_llm_timeout(Duration::from_secs(cfg.llm.request_timeout_secs));
        Self::new(Arc::new(SessionManager::from_config(&cfg.session)), engine)
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// 处理一条用户消息并返回回复
    ///
    /// 工作流内部的协议错误已转成提示文本；会话在本轮期间被淘汰时以新会话接续，
    /// 因此每轮都有回复。
    pub async fn handle_turn(&self, conversation_id: &str, user_text: &str) -> TurnReply {
        let gate = self.sessions.turn_gate(conversation_id).await;
        let _turn = gate.lock().await;

        let mut session = self.sessions.load(conversation_id).await;
        let mut state = AgentState::from_session(&session, user_text);
        self.engine.run(&mut state).await;

        state.write_back(&mut session);
        let session_id = self.sessions.commit(session).await;

        TurnReply {
            session_id,
            reply: state.reply,
            intent: state.intent,
            degraded: state.retrieval_degraded,
        }
    }
}
