// Gallery metadata abstraction — pluggable backends for the upstream API.

pub mod http_client;
pub mod naming;
pub mod traits;
