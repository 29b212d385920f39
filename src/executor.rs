//! Dispatch from wire-level query options to storage engine calls.
//!
//! Open-ended queries are closed with the [`MessageRef::MAX`] sentinel so
//! one range primitive serves every query shape.

use std::sync::Arc;

use crate::message::MessageRef;
use crate::messages::{QueryOptions, QueryRequest};
use crate::storage::{MessageStream, Storage};

/// Run a request's full local query: everything the local engine has for
/// the requested shape.
pub async fn run_local_query(storage: &Arc<dyn Storage>, request: &QueryRequest) -> MessageStream {
    match &request.options {
        QueryOptions::Last { count } => {
            storage
                .query_last(&request.stream_id, request.partition, *count)
                .await
        }
        QueryOptions::From { from, publisher } => {
            storage
                .query_range(
                    &request.stream_id,
                    request.partition,
                    *from,
                    MessageRef::MAX,
                    *publisher,
                    None,
                )
                .await
        }
        QueryOptions::Range {
            from,
            to,
            publisher,
            msg_chain_id,
        } => {
            storage
                .query_range(
                    &request.stream_id,
                    request.partition,
                    *from,
                    *to,
                    *publisher,
                    msg_chain_id.as_deref(),
                )
                .await
        }
    }
}

/// Re-query a committed ready range `[from, to]`, carrying the publisher
/// and chain filters from the original request.
pub async fn run_bounded_query(
    storage: &Arc<dyn Storage>,
    request: &QueryRequest,
    from: MessageRef,
    to: MessageRef,
) -> MessageStream {
    let (publisher, msg_chain_id) = match &request.options {
        QueryOptions::Last { .. } => (None, None),
        QueryOptions::From { publisher, .. } => (*publisher, None),
        QueryOptions::Range {
            publisher,
            msg_chain_id,
            ..
        } => (*publisher, msg_chain_id.as_deref()),
    };
    storage
        .query_range(
            &request.stream_id,
            request.partition,
            from,
            to,
            publisher,
            msg_chain_id,
        )
        .await
}
