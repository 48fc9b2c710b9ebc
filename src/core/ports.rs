//! TCP port checks and allocation for instances

use std::collections::HashMap;
use std::net::{Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;
use std::sync::Arc;

use tracing::debug;

use super::config::ConfigStore;
use crate::error::{ConfigError, Result};
use crate::persistence::StateStore;

/// Try to bind `port` on all interfaces; true if the bind succeeded
pub fn check_port_available(port: u16) -> bool {
    if port == 0 {
        return false;
    }
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

/// Outcome of validating a port for one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCheck {
    pub valid: bool,
    pub message: String,
}

impl PortCheck {
    fn ok(port: u16) -> Self {
        Self {
            valid: true,
            message: format!("port {} is available", port),
        }
    }

    fn rejected(message: String) -> Self {
        Self {
            valid: false,
            message,
        }
    }
}

/// Hands out ports without colliding with other instances or foreign processes
pub struct PortAllocator {
    store: Arc<StateStore>,
    configs: Arc<dyn ConfigStore>,
    range: RangeInclusive<u16>,
}

impl PortAllocator {
    pub fn new(
        store: Arc<StateStore>,
        configs: Arc<dyn ConfigStore>,
        range: RangeInclusive<u16>,
    ) -> Self {
        Self {
            store,
            configs,
            range,
        }
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.range.clone()
    }

    /// Ports recorded in runtime rows of instances other than `name`
    fn claimed_by_others(&self, name: Option<&str>) -> Result<HashMap<u16, String>> {
        Ok(self
            .store
            .claimed_ports()?
            .into_iter()
            .filter(|(owner, _)| Some(owner.as_str()) != name)
            .map(|(owner, port)| (port, owner))
            .collect())
    }

    /// First bindable port in `range` that is neither excluded nor claimed
    pub fn find_free_port(
        &self,
        range: RangeInclusive<u16>,
        exclude: &[u16],
    ) -> Result<Option<u16>> {
        let claimed = self.claimed_by_others(None)?;
        let port = range
            .filter(|port| !exclude.contains(port) && !claimed.contains_key(port))
            .find(|port| check_port_available(*port));
        debug!(?port, "Free port search finished");
        Ok(port)
    }

    /// `preferred` (or the configured port) if usable, else a free port from the range
    ///
    /// Ports configured for or claimed by other instances are never suggested.
    pub fn suggest_port_for_instance(
        &self,
        name: &str,
        preferred: Option<u16>,
    ) -> Result<Option<u16>> {
        let preferred = match preferred {
            Some(port) => Some(port),
            None => match self.configs.get_instance_config(name) {
                Ok(config) => Some(config.port),
                Err(ConfigError::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            },
        };

        let mut exclude: Vec<u16> = self.claimed_by_others(Some(name))?.into_keys().collect();
        for other in self.configs.list_instances()? {
            if other != name {
                exclude.push(self.configs.get_instance_config(&other)?.port);
            }
        }

        if let Some(port) = preferred {
            if !exclude.contains(&port) && check_port_available(port) {
                return Ok(Some(port));
            }
        }
        self.find_free_port(self.range(), &exclude)
    }

    /// Whether `name` may bind `port` right now
    pub fn validate_port_for_instance(&self, port: u16, name: &str) -> Result<PortCheck> {
        if port == 0 {
            return Ok(PortCheck::rejected("port 0 is not a valid bind port".to_string()));
        }
        if let Some(owner) = self.claimed_by_others(Some(name))?.get(&port) {
            return Ok(PortCheck::rejected(format!(
                "port {} is claimed by instance '{}'",
                port, owner
            )));
        }
        if !check_port_available(port) {
            return Ok(PortCheck::rejected(format!(
                "port {} is in use by another process",
                port
            )));
        }
        Ok(PortCheck::ok(port))
    }
}
