pub mod engine;
pub mod handler;
pub mod message;
pub mod session;
pub mod topic;

pub use engine::{Broker, PublishReport};
pub use handler::{Publisher, TopicHandler};
pub use message::{Envelope, Origin, QoS};
pub use topic::{TopicFilter, TopicName};
