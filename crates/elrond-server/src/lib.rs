//! The elrond server: HTTP control plane wiring over `elrond-core`.

pub mod api;
