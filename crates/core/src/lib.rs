//! Shared types for the optforge work-dispatch stack: the work-item
//! envelope and its processing contract, the wire codecs, and the
//! configuration surface consumed by the broker, executor and TCP layers.

pub mod codec;
pub mod config;
pub mod item;

pub use codec::{BINARY_FORMAT_VERSION, CodecError, PAYLOAD_ROOT_TAG, WireFormat, decode, encode};
pub use config::{
    BrokerConfig, ConfigError, DispatchConfig, ExecutorConfig, TcpClientConfig, TcpServerConfig,
    WaitPolicyKind,
};
pub use item::{EvalError, Evaluate, ItemId, ItemStatus, ResultPair, WorkItem};
