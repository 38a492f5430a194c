pub mod error;
pub mod event;
pub mod result;
pub mod schema;

pub use error::{ErrorKind, ErrorPayload, InvokeError};
pub use event::{Event, PollResponse};
pub use result::{InvocationOutcome, ToolResponse};
pub use schema::{InputSchema, ToolCall, ToolSchema};
