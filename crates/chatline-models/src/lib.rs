pub mod channel;
pub mod credential;
pub mod envelope;
pub mod gateway;
pub mod presence;
pub mod rpc;
