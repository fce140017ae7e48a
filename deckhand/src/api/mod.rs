//! Contract types exchanged with the API surface.
pub mod models;
