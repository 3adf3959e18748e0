//! xproc - Remote procedure calls between processes on one host.
//!
//! An interface contract is described once by an [`InterfaceDescriptor`]. The
//! hosting process binds a [`ServiceObject`] to it in a [`ServiceRegistry`];
//! the calling process gets a [`Proxy`] from a [`ConnectionManager`] and calls
//! methods by name. Calls travel as framed transactions over a [`Transport`]:
//! in-process channels or loopback TCP.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use xproc::process_service::{self, ProcessService, ProcessServiceProxy, ProcessServiceStub};
//! use xproc::{ConnectionManager, ServiceHost, ServiceRegistry, TcpTransport};
//!
//! #[tokio::main]
//! async fn main() -> xproc::Result<()> {
//!     // Host side
//!     let registry = Arc::new(ServiceRegistry::new());
//!     registry.bind_service(
//!         process_service::descriptor()?,
//!         Arc::new(ProcessServiceStub::new(Arc::new(MyService::default()))),
//!     );
//!     let host = ServiceHost::start(registry, "127.0.0.1:0").await?;
//!
//!     // Caller side
//!     let manager = ConnectionManager::new(Arc::new(TcpTransport::new()));
//!     let service = ProcessServiceProxy::connect(&manager, &host.addr().to_string()).await?;
//!     println!("remote time: {}", service.get_current_time_stamp().await?);
//!
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod descriptor;
pub mod error;
pub mod error_handler;
pub mod host;
pub mod process_service;
pub mod proxy;
pub mod registry;
pub mod stub;
pub mod transport;
pub mod versioning;
pub mod wire;

// Re-export commonly used types
pub use codec::{Value, WireType};
pub use config::{CallConfig, ConnectionOptions, DispatcherOptions, TransportConfig};
pub use connection::{Connection, ConnectionManager, ConnectionState, DeathRecipient};
pub use descriptor::{
    DescriptorSummary, InterfaceDescriptor, InterfaceDescriptorBuilder, MethodDescriptor,
    FIRST_CALL_TRANSACTION, HANDSHAKE_TRANSACTION,
};
pub use error::{Result, XprocError};
pub use error_handler::{ChainedErrorHandler, ErrorHandler};
pub use host::{ServiceHost, ServiceHostHandle};
pub use proxy::Proxy;
pub use registry::ServiceRegistry;
pub use stub::{ServiceObject, StubDispatcher};
pub use transport::{Channel, MemoryTransport, TcpChannel, TcpTransport, Transport};
pub use wire::{Direction, Transaction};
