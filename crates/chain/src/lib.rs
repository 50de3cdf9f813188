//! Chain access for the sequencer.
//!
//! The core only needs a narrow window onto the chain: read process
//! descriptors, observe new-process events, and submit state transitions,
//! results and status changes. This crate provides that window over a pool
//! of RPC endpoints ([`pool`]) with replay-safe nonce management and
//! permanent/transient error classification ([`txmgr`]), plus the process
//! monitor that materializes new elections and downloads their censuses
//! ([`monitor`]). An in-memory implementation ([`mock`]) backs the tests.

pub mod mock;
pub mod monitor;
pub mod pool;
pub mod rpc;
pub mod store;
pub mod txmgr;

pub use mock::{MockChain, MockRpc};
pub use monitor::{CensusFetcher, ProcessMonitor};
pub use pool::RpcPool;
pub use rpc::{ChainRpc, TxPayload};
pub use store::ProcessStore;
pub use txmgr::{ChainAdapter, TxManager};
