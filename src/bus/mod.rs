//! # Message bus: topics, retained values, delivery tiers, last-will.
//!
//! The real fleet runs over an external broker; this module provides the
//! in-process implementation of the same contract, used for wiring jobs inside
//! one device process and for tests:
//!
//! - topic scheme `{root}/{unit}/{experiment}/{job_name}/{setting}` with
//!   `.../set` for remote write requests;
//! - retained last value per topic, replayed to late subscribers;
//! - three delivery tiers ([`QoS`]); [`BusClient::publish`] returns a
//!   [`Delivery`] handle that can be awaited for acknowledgement;
//! - a per-client [`LastWill`] published when the client is dropped without a
//!   clean [`BusClient::disconnect`], so an unclean exit is observable without
//!   a heartbeat timeout.
//!
//! Internally a thin wrapper over [`tokio::sync::broadcast`] plus a retained
//! map; all delivery tiers behave identically in-process (the tier is part of
//! the wire contract, recorded on every message for the transport to honor).

mod broker;
mod client;
mod topic;

pub use broker::{Bus, BusMessage, QoS};
pub use client::{BusClient, Delivery, LastWill, Subscription};
pub use topic::{
    set_topic, setting_topic, topic_matches, STATE_SETTING, UNIVERSAL_EXPERIMENT, UNIVERSAL_UNIT,
};
