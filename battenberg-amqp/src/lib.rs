//! `battenberg-amqp` is a thin capability layer on top of [`lapin`], our AMQP client.
//!
//! It provides:
//! - [`BrokerSettings`], holding the parameters required to connect to an AMQP broker;
//! - the [`transport`] traits consumed by `battenberg-amqp-pool` — dialing a connection,
//!   observing asynchronous close and flow-control notifications, opening sessions and
//!   publishing with confirms;
//! - [`AmqpBroker`], the production implementation of those traits over [`lapin`].
//!
//! [`lapin`]: https://docs.rs/crate/lapin
//! [`BrokerSettings`]: configuration::BrokerSettings
//! [`AmqpBroker`]: rabbit_mq::AmqpBroker

pub mod configuration;
pub mod rabbit_mq;
pub mod transport;
