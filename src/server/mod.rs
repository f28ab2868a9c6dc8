// HTTP surface — websocket channel and archive retrieval endpoint.

pub mod handler;
