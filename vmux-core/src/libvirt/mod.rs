//! Hypervisor (KVM/libvirt) access: connection pooling and the domain,
//! storage and network managers built on top of it.

pub mod domain;
pub mod network;
pub mod pool;
pub mod storage;

pub use domain::DomainManager;
pub use network::NetworkManager;
pub use pool::ConnectionPool;
pub use storage::StorageManager;
