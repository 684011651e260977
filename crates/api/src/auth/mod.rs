//! Bearer token verification. See [`jwt`].

pub mod jwt;
