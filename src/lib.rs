//! Multi-account mail synchronization daemon: protocol adapters (IMAP,
//! POP3, OAuth2-over-IMAP), a per-account sync engine, an AI
//! classification stage and durable per-account storage, all fanned out
//! through one registry.

pub mod adapter;
pub mod classify;
pub mod error;
pub mod events;
pub mod model;
pub mod normalize;
pub mod registry;
pub mod secrets;
pub mod settings;
pub mod store;
pub mod sync;

#[cfg(test)]
mod tests;
