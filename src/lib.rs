//! Session authorization and playback synchronization for a remote
//! streaming engine.
//!
//! * [`auth`]: OAuth2 authorization code flow with PKCE, credential
//!   persistence and single-flight refresh
//! * [`player`]: folds the engine's event stream into an observable
//!   playback state, with position extrapolation and metadata resolution
//! * [`session`]: keeps a synchronizer running exactly while authorized
//!
//! The playback engine and the secure store are external collaborators,
//! reached through the [`engine::Engine`] and [`store::SecureStore`]
//! traits.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

#[macro_use]
extern crate log;

pub mod auth;
pub mod config;
pub mod credential;
pub mod engine;
pub mod error;
pub mod events;
pub mod http;
pub mod metadata;
pub mod pkce;
pub mod player;
pub mod protocol;
pub mod session;
pub mod signal;
pub mod store;
