//! Domain entities: device descriptions, machine identity, and trust policy.
//!
//! Everything in this module is plain data. The infrastructure layers of the
//! daemon (evdev, uinput, mDNS, the config file) produce and consume these
//! types but the types themselves know nothing about where they came from.

pub mod device;
pub mod identity;
pub mod policy;
