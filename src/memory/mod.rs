//! 用户记忆
//!
//! - **store**: MemoryStore 契约与实现（内存 / JSON 文件）
//! - **user_memory**: 按用户串行化的读-改-写、参数回填、上下文渲染

pub mod store;
pub mod user_memory;

pub use store::{InMemoryStore, JsonFileStore, MemoryRecord, MemoryStore};
pub use user_memory::{UserMemory, LAST_CALL_ARGS, QUERY_HISTORY};
