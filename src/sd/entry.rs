//! SOME/IP-SD entry types.

use crate::error::DecodeError;
use crate::header::ServiceId;

use super::types::{EntryType, EventgroupId, InstanceId, SD_ENTRY_SIZE};

/// The two option-index runs an entry carries into the shared options array.
///
/// Run 1 references the entry's primary endpoint/config options, run 2 its
/// secondary. Counts are 4-bit on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OptionRuns {
    /// Start index of the first run.
    pub index1: u8,
    /// Number of options in the first run.
    pub count1: u8,
    /// Start index of the second run.
    pub index2: u8,
    /// Number of options in the second run.
    pub count2: u8,
}

impl OptionRuns {
    /// An entry referencing no options.
    pub const NONE: OptionRuns = OptionRuns {
        index1: 0,
        count1: 0,
        index2: 0,
        count2: 0,
    };

    fn from_bytes(data: &[u8]) -> Self {
        Self {
            index1: data[1],
            index2: data[2],
            count1: (data[3] >> 4) & 0x0F,
            count2: data[3] & 0x0F,
        }
    }

    fn write(&self, buf: &mut [u8]) {
        buf[1] = self.index1;
        buf[2] = self.index2;
        buf[3] = ((self.count1 & 0x0F) << 4) | (self.count2 & 0x0F);
    }
}

/// A service entry (Find-Service or Offer-Service / Stop-Offer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    /// Entry type (FindService or OfferService).
    pub entry_type: EntryType,
    /// Option index runs.
    pub runs: OptionRuns,
    /// Service ID.
    pub service_id: ServiceId,
    /// Instance ID.
    pub instance_id: InstanceId,
    /// Major version.
    pub major_version: u8,
    /// Time-to-live in seconds, 24 bits (0 = stop offer).
    pub ttl: u32,
    /// Minor version.
    pub minor_version: u32,
}

impl ServiceEntry {
    /// Create a Find-Service entry.
    pub fn find(
        service_id: ServiceId,
        instance_id: InstanceId,
        major_version: u8,
        minor_version: u32,
    ) -> Self {
        Self {
            entry_type: EntryType::FindService,
            runs: OptionRuns::NONE,
            service_id,
            instance_id,
            major_version,
            ttl: 0xFF_FFFF,
            minor_version,
        }
    }

    /// Create an Offer-Service entry.
    pub fn offer(
        service_id: ServiceId,
        instance_id: InstanceId,
        major_version: u8,
        minor_version: u32,
        ttl: u32,
    ) -> Self {
        Self {
            entry_type: EntryType::OfferService,
            runs: OptionRuns::NONE,
            service_id,
            instance_id,
            major_version,
            ttl: ttl & 0xFF_FFFF,
            minor_version,
        }
    }

    /// Create a Stop-Offer entry (Offer with TTL = 0).
    pub fn stop_offer(
        service_id: ServiceId,
        instance_id: InstanceId,
        major_version: u8,
        minor_version: u32,
    ) -> Self {
        Self::offer(service_id, instance_id, major_version, minor_version, 0)
    }

    /// Check if this is a stop offer (Offer with TTL = 0).
    pub fn is_stop_offer(&self) -> bool {
        self.entry_type == EntryType::OfferService && self.ttl == 0
    }

    fn from_bytes(data: &[u8], entry_type: EntryType) -> Self {
        Self {
            entry_type,
            runs: OptionRuns::from_bytes(data),
            service_id: ServiceId(u16::from_be_bytes([data[4], data[5]])),
            instance_id: InstanceId(u16::from_be_bytes([data[6], data[7]])),
            major_version: data[8],
            ttl: u32::from_be_bytes([0, data[9], data[10], data[11]]),
            minor_version: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
        }
    }

    /// Serialize the entry to its 16-byte wire form.
    pub fn to_bytes(&self) -> [u8; SD_ENTRY_SIZE] {
        let mut buf = [0u8; SD_ENTRY_SIZE];
        buf[0] = self.entry_type as u8;
        self.runs.write(&mut buf);
        buf[4..6].copy_from_slice(&self.service_id.0.to_be_bytes());
        buf[6..8].copy_from_slice(&self.instance_id.0.to_be_bytes());
        buf[8] = self.major_version;
        buf[9..12].copy_from_slice(&self.ttl.to_be_bytes()[1..]);
        buf[12..16].copy_from_slice(&self.minor_version.to_be_bytes());
        buf
    }
}

/// An eventgroup entry (Subscribe / Stop-Subscribe / Ack / Nack).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventgroupEntry {
    /// Entry type (SubscribeEventgroup or SubscribeEventgroupAck).
    pub entry_type: EntryType,
    /// Option index runs.
    pub runs: OptionRuns,
    /// Service ID.
    pub service_id: ServiceId,
    /// Instance ID.
    pub instance_id: InstanceId,
    /// Major version.
    pub major_version: u8,
    /// Time-to-live in seconds, 24 bits (0 = unsubscribe/nack).
    pub ttl: u32,
    /// Counter distinguishing parallel subscriptions (4 bits).
    pub counter: u8,
    /// Eventgroup ID.
    pub eventgroup_id: EventgroupId,
}

impl EventgroupEntry {
    /// Create a Subscribe-Eventgroup entry.
    pub fn subscribe(
        service_id: ServiceId,
        instance_id: InstanceId,
        major_version: u8,
        eventgroup_id: EventgroupId,
        ttl: u32,
    ) -> Self {
        Self {
            entry_type: EntryType::SubscribeEventgroup,
            runs: OptionRuns::NONE,
            service_id,
            instance_id,
            major_version,
            ttl: ttl & 0xFF_FFFF,
            counter: 0,
            eventgroup_id,
        }
    }

    /// Create a Stop-Subscribe entry (Subscribe with TTL = 0).
    pub fn stop_subscribe(
        service_id: ServiceId,
        instance_id: InstanceId,
        major_version: u8,
        eventgroup_id: EventgroupId,
    ) -> Self {
        Self::subscribe(service_id, instance_id, major_version, eventgroup_id, 0)
    }

    /// Create a Subscribe-Eventgroup-Ack entry.
    pub fn ack(
        service_id: ServiceId,
        instance_id: InstanceId,
        major_version: u8,
        eventgroup_id: EventgroupId,
        ttl: u32,
        counter: u8,
    ) -> Self {
        Self {
            entry_type: EntryType::SubscribeEventgroupAck,
            runs: OptionRuns::NONE,
            service_id,
            instance_id,
            major_version,
            ttl: ttl & 0xFF_FFFF,
            counter,
            eventgroup_id,
        }
    }

    /// Create a Subscribe-Nack entry (Ack with TTL = 0).
    pub fn nack(
        service_id: ServiceId,
        instance_id: InstanceId,
        major_version: u8,
        eventgroup_id: EventgroupId,
        counter: u8,
    ) -> Self {
        Self::ack(service_id, instance_id, major_version, eventgroup_id, 0, counter)
    }

    /// Check if this is a stop-subscribe or nack (TTL = 0).
    pub fn is_negative(&self) -> bool {
        self.ttl == 0
    }

    fn from_bytes(data: &[u8], entry_type: EntryType) -> Self {
        Self {
            entry_type,
            runs: OptionRuns::from_bytes(data),
            service_id: ServiceId(u16::from_be_bytes([data[4], data[5]])),
            instance_id: InstanceId(u16::from_be_bytes([data[6], data[7]])),
            major_version: data[8],
            ttl: u32::from_be_bytes([0, data[9], data[10], data[11]]),
            // Byte 12 reserved, byte 13 low nibble carries the counter.
            counter: data[13] & 0x0F,
            eventgroup_id: EventgroupId(u16::from_be_bytes([data[14], data[15]])),
        }
    }

    /// Serialize the entry to its 16-byte wire form.
    pub fn to_bytes(&self) -> [u8; SD_ENTRY_SIZE] {
        let mut buf = [0u8; SD_ENTRY_SIZE];
        buf[0] = self.entry_type as u8;
        self.runs.write(&mut buf);
        buf[4..6].copy_from_slice(&self.service_id.0.to_be_bytes());
        buf[6..8].copy_from_slice(&self.instance_id.0.to_be_bytes());
        buf[8] = self.major_version;
        buf[9..12].copy_from_slice(&self.ttl.to_be_bytes()[1..]);
        buf[13] = self.counter & 0x0F;
        buf[14..16].copy_from_slice(&self.eventgroup_id.0.to_be_bytes());
        buf
    }
}

/// An SD entry of either family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdEntry {
    /// Find/Offer entry.
    Service(ServiceEntry),
    /// Subscribe/Ack entry.
    Eventgroup(EventgroupEntry),
}

impl SdEntry {
    /// Parse one 16-byte entry.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < SD_ENTRY_SIZE {
            return Err(DecodeError::Truncated {
                expected: SD_ENTRY_SIZE,
                actual: data.len(),
            });
        }

        let entry_type = EntryType::from_u8(data[0])?;
        if entry_type.is_service_entry() {
            Ok(Self::Service(ServiceEntry::from_bytes(data, entry_type)))
        } else {
            Ok(Self::Eventgroup(EventgroupEntry::from_bytes(data, entry_type)))
        }
    }

    /// Serialize the entry.
    pub fn to_bytes(&self) -> [u8; SD_ENTRY_SIZE] {
        match self {
            Self::Service(e) => e.to_bytes(),
            Self::Eventgroup(e) => e.to_bytes(),
        }
    }

    /// The entry's option runs.
    pub fn runs(&self) -> OptionRuns {
        match self {
            Self::Service(e) => e.runs,
            Self::Eventgroup(e) => e.runs,
        }
    }

    /// The entry's service id.
    pub fn service_id(&self) -> ServiceId {
        match self {
            Self::Service(e) => e.service_id,
            Self::Eventgroup(e) => e.service_id,
        }
    }

    /// The entry's instance id.
    pub fn instance_id(&self) -> InstanceId {
        match self {
            Self::Service(e) => e.instance_id,
            Self::Eventgroup(e) => e.instance_id,
        }
    }

    /// The entry's TTL.
    pub fn ttl(&self) -> u32 {
        match self {
            Self::Service(e) => e.ttl,
            Self::Eventgroup(e) => e.ttl,
        }
    }
}
