//! Chat turns: routing, context assembly, completion and session history

pub mod assembler;
pub mod completion;
pub mod error;
pub mod event;
pub mod llm;
pub mod pipeline;
pub mod router;
pub mod session;

pub use assembler::ContextAssembler;
pub use completion::CompletionService;
pub use error::{ChatError, LlmError, LlmResult};
pub use event::TurnEvent;
pub use pipeline::{TurnOutcome, TurnPipeline};
pub use router::{IntentRouter, KeywordRouter, LlmRouter};
pub use session::{ConversationSession, SessionStore};
