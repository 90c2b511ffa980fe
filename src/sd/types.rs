//! SOME/IP-SD type definitions and constants.

use std::net::Ipv4Addr;

use crate::error::DecodeError;

/// SD service id (always 0xFFFF).
pub const SD_SERVICE_ID: u16 = 0xFFFF;

/// SD method id (always 0x8100).
pub const SD_METHOD_ID: u16 = 0x8100;

/// Full SD message id (service << 16 | method).
pub const SD_MESSAGE_ID: u32 = 0xFFFF_8100;

/// Default SD multicast address.
pub const SD_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(224, 224, 224, 245);

/// Default SD port.
pub const SD_DEFAULT_PORT: u16 = 30490;

/// Size of an SD entry in bytes.
pub const SD_ENTRY_SIZE: usize = 16;

/// Bytes of an SD option preceding its body (length field + type field).
/// The length field counts every byte after the type field, so the option
/// body starts with the reserved byte.
pub const SD_OPTION_PREFIX_SIZE: usize = 3;

/// Instance ID for a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct InstanceId(pub u16);

impl InstanceId {
    /// Wildcard instance id that matches any instance.
    pub const ANY: InstanceId = InstanceId(0xFFFF);

    /// Check if this is the wildcard instance id.
    pub fn is_any(&self) -> bool {
        self.0 == 0xFFFF
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Eventgroup ID for event subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EventgroupId(pub u16);

impl std::fmt::Display for EventgroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// SD entry types.
///
/// TTL = 0 flips the positive kinds to their negative counterparts:
/// Offer becomes Stop-Offer, Subscribe becomes Stop-Subscribe, Ack becomes
/// Nack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryType {
    /// Find a service.
    FindService = 0x00,
    /// Offer a service (TTL > 0) or stop offering (TTL = 0).
    OfferService = 0x01,
    /// Subscribe to an eventgroup (TTL > 0) or unsubscribe (TTL = 0).
    SubscribeEventgroup = 0x06,
    /// Acknowledge (TTL > 0) or reject (TTL = 0) a subscription.
    SubscribeEventgroupAck = 0x07,
}

impl EntryType {
    /// Create an EntryType from a raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0x00 => Ok(Self::FindService),
            0x01 => Ok(Self::OfferService),
            0x06 => Ok(Self::SubscribeEventgroup),
            0x07 => Ok(Self::SubscribeEventgroupAck),
            other => Err(DecodeError::UnknownEntryType(other)),
        }
    }

    /// Check if this is a service entry type (Find/Offer).
    pub fn is_service_entry(&self) -> bool {
        matches!(self, Self::FindService | Self::OfferService)
    }

    /// Check if this is an eventgroup entry type (Subscribe/Ack).
    pub fn is_eventgroup_entry(&self) -> bool {
        matches!(self, Self::SubscribeEventgroup | Self::SubscribeEventgroupAck)
    }
}

/// SD option types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OptionType {
    /// Configuration string option (decoded, ignored).
    Configuration = 0x01,
    /// Load balancing option (decoded, ignored).
    LoadBalancing = 0x02,
    /// IPv4 endpoint option.
    Ipv4Endpoint = 0x04,
    /// IPv4 multicast option.
    Ipv4Multicast = 0x14,
}

impl OptionType {
    /// Create an OptionType from a raw byte value, `None` for unrecognized
    /// kinds (which are carried as opaque and skipped).
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Configuration),
            0x02 => Some(Self::LoadBalancing),
            0x04 => Some(Self::Ipv4Endpoint),
            0x14 => Some(Self::Ipv4Multicast),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_type_from_u8() {
        assert_eq!(EntryType::from_u8(0x00), Ok(EntryType::FindService));
        assert_eq!(EntryType::from_u8(0x01), Ok(EntryType::OfferService));
        assert_eq!(EntryType::from_u8(0x06), Ok(EntryType::SubscribeEventgroup));
        assert_eq!(
            EntryType::from_u8(0x07),
            Ok(EntryType::SubscribeEventgroupAck)
        );
        assert_eq!(
            EntryType::from_u8(0xFF),
            Err(DecodeError::UnknownEntryType(0xFF))
        );
    }

    #[test]
    fn test_option_type_from_u8() {
        assert_eq!(OptionType::from_u8(0x04), Some(OptionType::Ipv4Endpoint));
        assert_eq!(OptionType::from_u8(0x14), Some(OptionType::Ipv4Multicast));
        assert_eq!(OptionType::from_u8(0x01), Some(OptionType::Configuration));
        assert_eq!(OptionType::from_u8(0x02), Some(OptionType::LoadBalancing));
        assert_eq!(OptionType::from_u8(0x26), None);
    }

    #[test]
    fn test_instance_id_any() {
        assert!(InstanceId::ANY.is_any());
        assert!(!InstanceId(0x0001).is_any());
    }

    #[test]
    fn test_sd_message_id() {
        assert_eq!(
            SD_MESSAGE_ID,
            ((SD_SERVICE_ID as u32) << 16) | SD_METHOD_ID as u32
        );
    }
}
