//! botcheck - conversational bot test driver
//!
//! Runs scripted conversations ("convos") against a bot over HTTP and checks
//! every bot turn with text matching, JSONPath asserters and other scripting
//! components. Bot answers arrive synchronously, by polling, or through an
//! inbound webhook.

pub mod capabilities;
pub mod connector;
pub mod convo;
pub mod error;
pub mod inbound;
pub mod json_query;
pub mod matching;
pub mod runner;
pub mod scripting;
pub mod template;

pub use capabilities::{Capabilities, Capability};
pub use connector::{Connector, ConnectorPhase, HookRegistry, LoggingConnector, RateLimiter, SimpleRestConnector};
pub use convo::{load_convos, BotMsg, Convo, ConvoStep, MeMsg, Sender, StepRef};
pub use error::{AssertionCause, TestError, TestErrorKind, TestResult};
pub use inbound::{InboundHub, InboundServer};
pub use runner::{ConvoOutcome, ConvoRunner};
pub use scripting::{ScriptingRegistry, ScriptingSession};
