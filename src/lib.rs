#![doc = include_str!("../README.md")]
#![deny(unsafe_code, missing_docs)]

pub mod admission;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod filter;
pub mod fragment;
pub mod integrity;
pub mod packet;
pub mod qos;
pub mod replay;
pub mod simulator;
pub mod transport;
