//! 核心层：错误与恢复、优雅关闭、运行时组装

pub mod builder;
pub mod error;
pub mod recovery;
pub mod shutdown;

pub use builder::{create_llm_from_config, load_system_prompt, Hive, HiveBuilder};
pub use error::{ErrorKind, HiveError, RecoveryAction};
pub use recovery::RecoveryEngine;
pub use shutdown::{
    run_with_graceful_shutdown, SessionCleanup, ShutdownCleanup, ShutdownCoordinator,
    ShutdownManager, ShutdownReason,
};
