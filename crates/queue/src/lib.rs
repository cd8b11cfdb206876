pub mod broker;
pub mod error;
pub mod memory;
pub mod parser;
pub mod poller;
pub mod sqs;
pub mod topics;

pub use broker::{Broker, BrokerHealth, BrokerMessage, CommitRecord};
pub use error::QueueError;
pub use memory::{MemoryBroker, MemoryLog};
pub use parser::parse_message;
pub use poller::{IngressPoller, PollerSettings, PollerStats};
pub use sqs::SqsBroker;
pub use topics::{
    commit_channel, topic_queues, CommitReceiver, CommitSender, Delivery, TopicQueues,
    TopicSenders,
};
