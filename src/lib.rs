//! Local disk cache and sync engine for an end-to-end encrypted object
//! store. Object bytes are opaque here; the engine stores versions, fetches
//! missing ranges, uploads local changes resumably and collects versions
//! nothing refers to.

pub mod config;
pub mod errors;
pub mod models;
pub mod services;

#[cfg(test)]
mod testutil;
#[cfg(test)]
mod tests;
