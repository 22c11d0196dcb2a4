//! Process-wide work dispatch: buffer ports, the broker that routes raw
//! items to consumers and processed items back, the consumer contract with
//! an in-process thread-pool implementation, and the producer-side
//! executors.

mod broker;
mod consumer;
mod executor;
mod pool;
mod port;
mod queue;

pub use broker::{
    Broker, BrokerError, BrokerSnapshot, ConsumerId, ConsumerSnapshot, PortSnapshot, PortToken,
    RunState,
};
pub use consumer::{Consumer, ThreadPoolConsumer};
pub use executor::{CancelHandle, Executor, SubmitReport};
pub use pool::{ThreadGroup, ThreadPool};
pub use port::{BufferPort, PortId};
