//! Sentinel pub/sub payload parsing
//!
//! Sentinel publishes failover notifications as space separated tokens at fixed
//! positions. There is no grammar beyond that, so each payload is decoded by
//! position:
//!
//! ```text
//! +switch-master  <name> <old-ip> <old-port> <new-ip> <new-port>
//! +sentinel       <instance-type> <name> <ip> <port> @ <master-name> <master-ip> <master-port>
//! ```
//!
//! Port tokens that are not base-10 integers in the TCP range are rejected with
//! [`ParseError::InvalidPort`]; they never default to zero.

use crate::error::ParseError;
use crate::types::MasterSwitchedEvent;

/// Channel announcing a promoted master
pub const SWITCH_MASTER_CHANNEL: &str = "+switch-master";

/// Channel announcing a newly discovered sentinel
pub const SENTINEL_CHANNEL: &str = "+sentinel";

/// Channel announcing a replica finished reconfiguring
pub const SLAVE_RECONF_DONE_CHANNEL: &str = "+slave-reconf-done";

/// Every channel a monitor subscribes to
pub const MONITORED_CHANNELS: [&str; 3] = [
    SWITCH_MASTER_CHANNEL,
    SENTINEL_CHANNEL,
    SLAVE_RECONF_DONE_CHANNEL,
];

/// Known Sentinel notification channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelChannel {
    /// `+switch-master`
    SwitchMaster,
    /// `+sentinel`
    Sentinel,
    /// `+slave-reconf-done`
    SlaveReconfDone,
}

impl SentinelChannel {
    /// Classify a channel name; `None` for anything not subscribed to
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            SWITCH_MASTER_CHANNEL => Some(Self::SwitchMaster),
            SENTINEL_CHANNEL => Some(Self::Sentinel),
            SLAVE_RECONF_DONE_CHANNEL => Some(Self::SlaveReconfDone),
            _ => None,
        }
    }
}

/// Parse a `+switch-master` payload
pub fn parse_switch_master(text: &str) -> Result<MasterSwitchedEvent, ParseError> {
    let input = text.trim();
    let tokens: Vec<&str> = input.split(' ').collect();

    let name = token(&tokens, 0, "cluster name", input)?;
    let old_master_ip = token(&tokens, 1, "old master ip", input)?;
    let old_master_port = parse_port(token(&tokens, 2, "old master port", input)?, input)?;
    let new_master_ip = token(&tokens, 3, "new master ip", input)?;
    let new_master_port = parse_port(token(&tokens, 4, "new master port", input)?, input)?;

    Ok(MasterSwitchedEvent {
        name: name.to_string(),
        old_master_ip: old_master_ip.to_string(),
        old_master_port,
        new_master_ip: new_master_ip.to_string(),
        new_master_port,
    })
}

/// Parse a `+sentinel` payload into the announced sentinel's host and port.
///
/// Only tokens 2 (ip) and 3 (port) are read.
pub fn parse_sentinel_announce(text: &str) -> Result<(String, u16), ParseError> {
    let input = text.trim();
    let tokens: Vec<&str> = input.split(' ').collect();

    let host = token(&tokens, 2, "instance ip", input)?;
    let port = parse_port(token(&tokens, 3, "instance port", input)?, input)?;

    Ok((host.to_string(), port))
}

/// Parse a port token
pub(crate) fn parse_port(token: &str, input: &str) -> Result<u16, ParseError> {
    token.parse::<u16>().map_err(|_| ParseError::InvalidPort {
        token: token.to_string(),
        input: input.to_string(),
    })
}

fn token<'a>(
    tokens: &[&'a str],
    position: usize,
    expected: &'static str,
    input: &str,
) -> Result<&'a str, ParseError> {
    match tokens.get(position) {
        Some(t) if !t.is_empty() => Ok(t),
        _ => Err(ParseError::MissingToken {
            position,
            expected,
            input: input.to_string(),
        }),
    }
}
