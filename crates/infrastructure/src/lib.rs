//! Infrastructure adapters for application ports.

#![forbid(unsafe_code)]

mod fs_workspace_cleaner;
mod in_memory_record_store;
mod in_process_queue_transport;
mod postgres_record_store;
mod redis_queue_transport;
mod static_group_resolver;

pub use fs_workspace_cleaner::FsWorkspaceCleaner;
pub use in_memory_record_store::InMemoryRecordStore;
pub use in_process_queue_transport::InProcessQueueTransport;
pub use postgres_record_store::PostgresRecordStore;
pub use redis_queue_transport::RedisQueueTransport;
pub use static_group_resolver::StaticGroupResolver;
