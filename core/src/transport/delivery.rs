//! Delivery Modes
//!
//! Maps the driver's delivery guarantees onto relay send flags. Only the
//! reliable/unreliable distinction survives; ordering and fragmentation are
//! left to the relay provider.

use std::ops::{BitOr, BitOrAssign};

use crate::error::ProviderError;
use crate::transport::ClientId;

/// Delivery guarantee requested for a send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum NetworkDelivery {
    Unreliable = 0,
    UnreliableSequenced = 1,
    Reliable = 2,
    ReliableSequenced = 3,
    ReliableFragmentedSequenced = 4,
}

impl NetworkDelivery {
    pub const ALL: [NetworkDelivery; 5] = [
        NetworkDelivery::Unreliable,
        NetworkDelivery::UnreliableSequenced,
        NetworkDelivery::Reliable,
        NetworkDelivery::ReliableSequenced,
        NetworkDelivery::ReliableFragmentedSequenced,
    ];

    /// Unknown values fall back to `Unreliable`
    pub fn from_raw(value: i32) -> Self {
        match value {
            1 => NetworkDelivery::UnreliableSequenced,
            2 => NetworkDelivery::Reliable,
            3 => NetworkDelivery::ReliableSequenced,
            4 => NetworkDelivery::ReliableFragmentedSequenced,
            _ => NetworkDelivery::Unreliable,
        }
    }
}

/// Relay provider send flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SendFlags(i32);

impl SendFlags {
    pub const UNRELIABLE: SendFlags = SendFlags(0);
    pub const RELIABLE: SendFlags = SendFlags(8);

    pub fn bits(&self) -> i32 {
        self.0
    }

    pub fn contains(&self, other: SendFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_reliable(&self) -> bool {
        self.contains(SendFlags::RELIABLE)
    }
}

impl BitOr for SendFlags {
    type Output = SendFlags;

    fn bitor(self, rhs: SendFlags) -> SendFlags {
        SendFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for SendFlags {
    fn bitor_assign(&mut self, rhs: SendFlags) {
        self.0 |= rhs.0;
    }
}

/// Map a delivery mode to send flags
pub fn map_delivery(delivery: NetworkDelivery) -> SendFlags {
    let mut flags = SendFlags::UNRELIABLE;
    match delivery {
        NetworkDelivery::Unreliable | NetworkDelivery::UnreliableSequenced => {}
        NetworkDelivery::Reliable
        | NetworkDelivery::ReliableSequenced
        | NetworkDelivery::ReliableFragmentedSequenced => flags |= SendFlags::RELIABLE,
    }
    flags
}

impl From<NetworkDelivery> for SendFlags {
    fn from(delivery: NetworkDelivery) -> Self {
        map_delivery(delivery)
    }
}

/// Why a send was not handed to the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// No client or server role is active
    NotActive,
    /// Client role without a live connection
    NoConnection,
    /// Server role and no connection has this id
    UnknownClient(ClientId),
    /// Connection exists but is not (or no longer) connected
    NotConnected,
    /// Provider refused the message
    Provider(ProviderError),
}

/// Result of a best-effort send. Dropping is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum SendOutcome {
    Sent,
    Dropped(DropReason),
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reliable_modes_set_reliable_flag() {
        for delivery in NetworkDelivery::ALL {
            let expected = matches!(
                delivery,
                NetworkDelivery::Reliable
                    | NetworkDelivery::ReliableSequenced
                    | NetworkDelivery::ReliableFragmentedSequenced
            );
            assert_eq!(map_delivery(delivery).is_reliable(), expected, "{:?}", delivery);
            assert_eq!(map_delivery(delivery), map_delivery(delivery));
        }
    }

    #[test]
    fn test_unreliable_modes_map_to_plain_unreliable() {
        assert_eq!(map_delivery(NetworkDelivery::Unreliable), SendFlags::UNRELIABLE);
        assert_eq!(
            map_delivery(NetworkDelivery::UnreliableSequenced),
            SendFlags::UNRELIABLE
        );
        assert_eq!(map_delivery(NetworkDelivery::Reliable).bits(), 8);
    }

    #[test]
    fn test_unknown_raw_value_is_unreliable() {
        assert_eq!(NetworkDelivery::from_raw(2), NetworkDelivery::Reliable);
        assert_eq!(NetworkDelivery::from_raw(-3), NetworkDelivery::Unreliable);
        assert_eq!(NetworkDelivery::from_raw(99), NetworkDelivery::Unreliable);
        assert!(!SendFlags::from(NetworkDelivery::from_raw(42)).is_reliable());
    }

    #[test]
    fn test_flag_combination() {
        let flags = SendFlags::UNRELIABLE | SendFlags::RELIABLE;
        assert!(flags.contains(SendFlags::RELIABLE));
        assert!(flags.contains(SendFlags::UNRELIABLE));
        assert!(!SendFlags::UNRELIABLE.contains(SendFlags::RELIABLE));
    }
}
