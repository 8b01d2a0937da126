//! Hardware abstraction layer configuration and driver contract.
//!
//! This module contains the I/O board configuration types and the
//! narrow driver trait every hardware backend implements.

pub mod config;
pub mod driver;
