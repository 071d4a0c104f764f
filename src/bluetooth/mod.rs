//! Bluetooth serial link layer.
//!
//! This module provides the transport abstraction, its BlueZ implementation,
//! the RFCOMM stream plumbing and the connection manager built on top.

pub mod bluez;
pub mod link;
pub mod manager;
pub mod transport;
