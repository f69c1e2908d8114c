//! 会话管理
//!
//! 每个对话 id 对应一个 Session：对话历史、购物车 id、结账 id、上一轮展示的候选商品。
//! 过期（TTL）与容量（LRU）两种淘汰独立生效；同一对话的轮次经 FIFO 闸门串行处理。
//! 会话表的锁只在同步读写时持有，不跨越任何 await。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SessionSection;
use crate::core::AgentError;
use crate::memory::ConversationMemory;
use crate::merchant::{CartId, CheckoutId, ProductId};

pub type SessionId = String;

/// 单个会话（只保存 id 引用，商品 / 购物车状态以商户为准）
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub conversation_id: String,
    pub created_at: Instant,
    pub last_active_at: Instant,
    pub history: ConversationMemory,
    pub cart_id: Option<CartId>,
    pub checkout_id: Option<CheckoutId>,
    /// 上一轮展示给用户的商品，供「那个」「第二个」指代
    pub last_candidates: Vec<ProductId>,
    /// LRU 次序（单调递增）
    access_seq: u64,
}

fn new_session_id() -> SessionId {
    format!("session_{}", uuid::Uuid::new_v4())
}

impl Session {
    fn new(conversation_id: &str, max_history_turns: usize, seq: u64) -> Self {
        let now = Instant::now();
        Self {
            id: new_session_id(),
            conversation_id: conversation_id.to_string(),
            created_at: now,
            last_active_at: now,
            history: ConversationMemory::new(max_history_turns),
            cart_id: None,
            checkout_id: None,
            last_candidates: Vec::new(),
            access_seq: seq,
        }
    }

    /// 会话是否过期
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.last_active_at.elapsed() > ttl
    }
}

/// 会话管理器
pub struct SessionManager {
    /// conversation_id -> Session
    sessions: RwLock<HashMap<String, Session>>,
    /// conversation_id -> 轮次闸门；与会话分开存放，淘汰会话不影响正在进行的轮次
    gates: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    seq: AtomicU64,
    ttl: Duration,
    max_sessions: usize,
    max_history_turns: usize,
}

impl SessionManager {
    pub fn new(ttl: Duration, max_sessions: usize, max_history_turns: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            gates: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            ttl,
            max_sessions: max_sessions.max(1),
            max_history_turns,
        }
    }

    pub fn from_config(cfg: &SessionSection) -> Self {
        Self::new(
            Duration::from_secs(cfg.ttl_secs),
            cfg.max_sessions,
            cfg.max_history_turns,
        )
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// 对话的轮次闸门；调用方持有 lock() 的守卫期间独占该对话
    pub async fn turn_gate(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        if let Some(gate) = self.gates.read().await.get(conversation_id) {
            return gate.clone();
        }
        self.gates
            .write()
            .await
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 取出会话快照（不存在或已过期则新建），并刷新活跃时间
    pub async fn load(&self, conversation_id: &str) -> Session {
        let seq = self.next_seq();
        let mut sessions = self.sessions.write().await;

        if let Some(session) = sessions.get_mut(conversation_id) {
            if !session.is_expired(self.ttl) {
                session.last_active_at = Instant::now();
                session.access_seq = seq;
                return session.clone();
            }
            tracing::info!(
                conversation_id,
                session_id = %session.id,
                "session expired, starting fresh"
            );
        }

        let session = Session::new(conversation_id, self.max_history_turns, seq);
        tracing::debug!(conversation_id, session_id = %session.id, "session created");
        sessions.insert(conversation_id.to_string(), session.clone());
        Self::evict_lru(&mut sessions, self.max_sessions);
        session
    }

    /// 读取会话；已淘汰时返回 SessionNotFound
    pub async fn get(&self, conversation_id: &str) -> Result<Session, AgentError> {
        self.sessions
            .read()
            .await
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| AgentError::SessionNotFound(conversation_id.to_string()))
    }

    /// 写回一轮结束后的会话，返回写入后的会话 id
    ///
    /// 会话在本轮期间被淘汰（或被替换）时，以新 id 重建会话，接续本轮的对话历史、
    /// 购物车 / 结账引用与候选，本轮结果不丢弃。
    pub async fn commit(&self, mut session: Session) -> SessionId {
        let seq = self.next_seq();
        let now = Instant::now();
        session.last_active_at = now;
        session.access_seq = seq;

        let mut sessions = self.sessions.write().await;
        if let Some(current) = sessions.get_mut(&session.conversation_id) {
            if current.id == session.id {
                let id = session.id.clone();
                *current = session;
                return id;
            }
        }

        let previous = std::mem::replace(&mut session.id, new_session_id());
        session.created_at = now;
        tracing::warn!(
            conversation_id = %session.conversation_id,
            previous_session = %previous,
            session_id = %session.id,
            "session evicted during turn, restored with this turn's state"
        );
        let id = session.id.clone();
        sessions.insert(session.conversation_id.clone(), session);
        Self::evict_lru(&mut sessions, self.max_sessions);
        id
    }

    /// 清理过期会话，并把会话数压到上限以内；返回移除数量
    pub async fn sweep(&self) -> usize {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let before = sessions.len();
            let ttl = self.ttl;
            sessions.retain(|_, s| !s.is_expired(ttl));
            let expired = before - sessions.len();
            expired + Self::evict_lru(&mut sessions, self.max_sessions)
        };

        // 无会话且无人持有的闸门一并回收
        let live: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        self.gates
            .write()
            .await
            .retain(|id, gate| live.contains(id) || Arc::strong_count(gate) > 1);

        if removed > 0 {
            tracing::info!(removed, "session sweep evicted sessions");
        }
        removed
    }

    /// 超出容量时按最久未活跃优先淘汰
    fn evict_lru(sessions: &mut HashMap<String, Session>, max_sessions: usize) -> usize {
        let mut evicted = 0;
        while sessions.len() > max_sessions {
            let oldest = sessions
                .iter()
                .min_by_key(|(_, s)| (s.last_active_at, s.access_seq))
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    if let Some(s) = sessions.remove(&id) {
                        tracing::debug!(conversation_id = %id, session_id = %s.id, "session evicted (capacity)");
                    }
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    /// 获取活跃会话数
    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn contains(&self, conversation_id: &str) -> bool {
        self.sessions.read().await.contains_key(conversation_id)
    }

    /// 启动后台清扫任务，token 取消后退出
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("session sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        manager.sweep().await;
                    }
                }
            }
        })
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600), 1000, 10)
    }
}
