pub mod accounting;
pub mod collaborators;
pub mod errors;
pub mod flow;
pub mod hub;
mod id;
pub mod instance;
pub mod manager;
pub mod net;
pub mod rule;
mod tcp;
mod udp;

pub use collaborators::{AccessAction, AccessLogStore, Broadcaster, GeoLookup, NullAccessLogStore, NullGeoLookup};
pub use errors::{BindError, CopyError, DialError, StartError};
pub use flow::{Flow, FlowProtocol, FlowSnapshot};
pub use hub::{Filter, Hub, Message, SubscriberHandle};
pub use instance::{Deps, Instance};
pub use manager::Manager;
pub use rule::{Rule, RuleProtocol, RuleStatus};
