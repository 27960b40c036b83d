// exchange/mod.rs

pub mod bridge;
pub mod errors;
pub mod facade;
pub mod hmac;
pub mod protocol;
pub mod queue;
pub mod traits;
pub mod transport;
pub mod venues;
pub mod wallet;
pub mod worker;

#[cfg(test)]
pub(crate) mod testkit;

// Re-exports for the orchestrator and embedding applications
pub use bridge::ResponseBridge;
pub use errors::ExchangeError;
pub use facade::{ExchangeFacade, FacadeSignal, SharedStore};
pub use protocol::{WorkerEvent, WorkerRequest};
pub use queue::RateQueue;
pub use traits::{ExchangeAdapter, PrivatePush, PublicPush};
pub use transport::{ReconnectingSocket, TransportConfig, TransportEvent};
pub use wallet::Wallet;
