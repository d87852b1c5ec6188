pub mod acl;
pub mod coordinator;
pub mod gateway;
pub mod orchestrator;
pub mod router;

pub use acl::{is_owner_authorized, AclMode};
pub use coordinator::{
    A2aBroadcast, A2aSend, AgentDispatcher, AgentReply, ChannelCoordinator, CoordinatorLimits,
    DiscussResult, DispatchInput, DispatchOutcome, FanOutResult, DISCUSSION_DONE_TOKEN,
};
pub use gateway::{Gateway, GatewayConfig};
pub use orchestrator::{Orchestrator, StubTaskRunner, TaskRunner};
pub use router::{parse_intent, Intent};
