//! Wire format of task-created events.
//!
//! Events are written into the outbox already encoded and the relay publishes
//! the stored bytes unchanged, so this is the only place the format lives.

use crate::Result;
use crate::types::TaskCreatedEvent;

/// JSON body of an event, as stored in the outbox and on the wire
pub fn encode_task_created(event: &TaskCreatedEvent) -> Result<String> {
    Ok(serde_json::to_string(event)?)
}

/// Parse a message body published for a task-created event
pub fn decode_task_created(payload: &[u8]) -> Result<TaskCreatedEvent> {
    Ok(serde_json::from_slice(payload)?)
}
