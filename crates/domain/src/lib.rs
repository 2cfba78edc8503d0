//! # tasmobridge-domain
//!
//! Pure domain model for the tasmobridge synchronisation engine.
//!
//! ## Responsibilities
//! - Foundational types: typed identifiers, error conventions, timestamps
//! - Define **Devices** (switch banks and shutters) and the records the host persists
//! - Define **Capabilities** (`onoff.1`..`onoff.4`, `position`) and their values
//! - Define **Triggers** (edge-triggered notifications such as `switch-2-on`)
//! - Define **Settings** and the broker **credentials** that key shared connections
//! - Define **Events** published towards the host
//!
//! ## Dependency rule
//! This crate has **no internal dependencies**.
//! It must never import anything from `app`, adapters, or external IO crates.
//! All IO boundaries are expressed as traits in the `app` crate (ports).

pub mod error;
pub mod id;
pub mod time;

pub mod availability;
pub mod capability;
pub mod credentials;
pub mod device;
pub mod event;
pub mod settings;
pub mod trigger;
