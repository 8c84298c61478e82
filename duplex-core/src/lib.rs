// vim: tw=80

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

pub mod bitmap;
pub mod blockio;
pub mod checkpoint;
pub mod chunk;
pub mod credit;
pub mod group;
pub mod metadata;
pub mod notify;
pub mod permit;
pub mod progress;
pub mod rebuild;
pub mod selector;
pub mod types;

pub use crate::types::*;
