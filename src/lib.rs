#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod client;
pub mod error;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub use client::{Channel, RealtimeClient};
pub use ws::connection::ConnectionState;
pub use ws::registry::ListenerId;
