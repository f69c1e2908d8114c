//! 核心层：错误分类与恢复、优雅关闭

pub mod error;
pub mod recovery;
pub mod shutdown;

pub use error::{AgentError, ErrorBody, ErrorCode, RecoveryAction};
pub use recovery::RecoveryEngine;
pub use shutdown::{
    FnCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, SupervisorCleanup,
};
