pub(crate) mod auth;
pub mod rpc;
