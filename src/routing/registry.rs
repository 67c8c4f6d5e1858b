//! # Channel Registry
//!
//! Static routing table from task type to channel, plus the fixed set of
//! channels a deployment accepts. Lookups are pure: the registry is built once
//! from configuration and never mutated afterwards.

use std::collections::BTreeMap;
use std::fmt;

use super::{RoutingError, TaskKind};
use crate::config::LanesConfig;
use crate::constants::{channels, wire};

/// A named, isolated processing lane and the queue that backs it
///
/// Each channel maps to its own broker virtual host; the queue name is shared
/// across channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    name: String,
    queue_name: String,
}

impl Channel {
    pub fn new(name: impl Into<String>, queue_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue_name: queue_name.into(),
        }
    }

    /// Channel name, which is also the broker virtual host
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.queue_name)
    }
}

#[derive(Debug, Clone)]
pub struct ChannelRegistry {
    routes: BTreeMap<String, String>,
    channels: Vec<String>,
    queue_name: String,
}

impl ChannelRegistry {
    /// Build a registry from an explicit routing table and channel list
    ///
    /// Duplicate channel names are collapsed, keeping first-seen order.
    pub fn new<R, C, K, V, N>(routes: R, channels: C, queue_name: impl Into<String>) -> Self
    where
        R: IntoIterator<Item = (K, V)>,
        C: IntoIterator<Item = N>,
        K: Into<String>,
        V: Into<String>,
        N: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for name in channels.into_iter().map(Into::into) {
            if !unique.contains(&name) {
                unique.push(name);
            }
        }

        Self {
            routes: routes
                .into_iter()
                .map(|(task_type, channel)| (task_type.into(), channel.into()))
                .collect(),
            channels: unique,
            queue_name: queue_name.into(),
        }
    }

    /// The reference routing table: twelve task kinds over four channels
    pub fn reference() -> Self {
        Self::new(
            TaskKind::ALL
                .iter()
                .map(|kind| (kind.as_str(), kind.default_channel())),
            channels::ALL,
            wire::DEFAULT_QUEUE_NAME,
        )
    }

    pub fn from_config(config: &LanesConfig) -> Self {
        Self::new(
            config.routing.clone(),
            config.channels.clone(),
            config.queue_name.clone(),
        )
    }

    /// Resolve the channel for a task type
    ///
    /// The returned channel is taken from the routing table as-is; membership
    /// in the valid channel set is checked separately by [`Self::ensure_valid`].
    pub fn resolve(&self, task_type: &str) -> Result<Channel, RoutingError> {
        if task_type.is_empty() {
            return Err(RoutingError::EmptyTaskType);
        }
        self.routes
            .get(task_type)
            .map(|name| Channel::new(name.as_str(), self.queue_name.as_str()))
            .ok_or_else(|| RoutingError::unmapped(task_type))
    }

    /// Look up a channel by name, failing if it is not a valid channel
    pub fn channel(&self, name: &str) -> Result<Channel, RoutingError> {
        if self.is_valid_channel(name) {
            Ok(Channel::new(name, self.queue_name.as_str()))
        } else {
            Err(RoutingError::invalid_channel(name))
        }
    }

    pub fn ensure_valid(&self, channel: &Channel) -> Result<(), RoutingError> {
        if self.is_valid_channel(channel.name()) {
            Ok(())
        } else {
            Err(RoutingError::invalid_channel(channel.name()))
        }
    }

    pub fn is_valid_channel(&self, name: &str) -> bool {
        self.channels.iter().any(|c| c == name)
    }

    /// Every valid channel, in configuration order
    pub fn channels(&self) -> Vec<Channel> {
        self.channels
            .iter()
            .map(|name| Channel::new(name.as_str(), self.queue_name.as_str()))
            .collect()
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(String::as_str)
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn routes(&self) -> &BTreeMap<String, String> {
        &self.routes
    }

    /// Task types routed to the given channel
    pub fn task_types_for(&self, channel: &str) -> Vec<&str> {
        self.routes
            .iter()
            .filter(|(_, target)| target.as_str() == channel)
            .map(|(task_type, _)| task_type.as_str())
            .collect()
    }

    /// Routes whose target channel is outside the valid set
    pub fn drifted_routes(&self) -> Vec<(&str, &str)> {
        self.routes
            .iter()
            .filter(|(_, target)| !self.is_valid_channel(target))
            .map(|(task_type, target)| (task_type.as_str(), target.as_str()))
            .collect()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::reference()
    }
}
