//! Relay side of the tether protocol.
//!
//! Agents dial in over WebSocket and stay attached; the relay pushes download
//! commands down that connection and reassembles the chunk stream that comes
//! back.
//!
//! ## Architecture
//!
//! - **AgentRegistry**: Tracks known agents, their connection handles, and liveness
//! - **RequestCorrelator**: Mints transfer requests and resolves them from chunk traffic
//! - **ChunkAssembler**: Index-ordered reassembly with gap detection
//! - **RelayNode**: Accepts agent connections and dispatches their envelopes

pub mod assembler;
pub mod correlator;
pub mod registry;
pub mod relay;
pub mod transport;

pub use assembler::{AssemblyError, ChunkAssembler};
pub use correlator::{RequestCorrelator, TransferOutcome};
pub use registry::{AgentRegistry, AgentSnapshot, ConnectionHandle, RegistryEvent};
pub use relay::RelayNode;
pub use transport::WireError;
