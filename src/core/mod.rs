// Core modules: on-disk format, ring planning, record access, and the pool engine built on them.
pub mod chunk;
pub mod codec;
pub mod cursor;
pub mod error;
pub mod format;
pub mod frame;
pub mod header;
pub mod index;
pub mod layout;
pub mod lock;
pub mod lookup;
pub mod notify;
pub mod options;
pub mod plan;
pub mod pool;
pub mod semaphore;
pub mod store;
pub mod validate;
