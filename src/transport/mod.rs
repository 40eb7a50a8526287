//! Message transports that feed [`crate::ingest::Recorder`].
//!
//! MQTT lives here; HTTP `POST /pub` is part of [`crate::server`].

pub mod mqtt;
