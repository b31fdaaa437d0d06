//! Client side of the job engine: queries a remote instance for job
//! snapshots and publishes snapshots to an HTTP message bus.

pub mod bus;
pub mod client;

pub use crate::{
    bus::HttpMessageBus,
    client::{Client, ClientError, SearchFilter, SearchOptions},
};
