//! SOME/IP-SD message encode/decode and packed-message building.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::DecodeError;
use crate::header::{ServiceId, SomeIpHeader};
use crate::message::SomeIpMessage;
use crate::types::MessageType;

use super::entry::{EventgroupEntry, OptionRuns, SdEntry, ServiceEntry};
use super::option::{Endpoint, SdOption};
use super::types::{EventgroupId, InstanceId, SD_ENTRY_SIZE, SD_MESSAGE_ID};

/// SD message flags (payload byte 0; reserved bits stay zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SdFlags {
    /// Reboot flag - set until the sender's first regular SD message.
    pub reboot: bool,
    /// Unicast flag - the sender supports receiving unicast SD.
    pub unicast: bool,
}

impl SdFlags {
    /// Parse flags from the payload byte.
    pub fn from_u8(byte: u8) -> Self {
        Self {
            reboot: byte & 0x80 != 0,
            unicast: byte & 0x40 != 0,
        }
    }

    /// Serialize flags to the payload byte.
    pub fn to_u8(self) -> u8 {
        let mut byte = 0u8;
        if self.reboot {
            byte |= 0x80;
        }
        if self.unicast {
            byte |= 0x40;
        }
        byte
    }
}

/// The primary/secondary endpoints resolved from an entry's option runs.
///
/// Run 1 yields the primary endpoint, run 2 the secondary (a service
/// reachable over both TCP and UDP advertises one of each).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndpointPair {
    /// Endpoint from the first option run.
    pub primary: Option<Endpoint>,
    /// Endpoint from the second option run.
    pub secondary: Option<Endpoint>,
}

impl EndpointPair {
    /// A pair with only the primary endpoint.
    pub fn single(endpoint: Endpoint) -> Self {
        Self {
            primary: Some(endpoint),
            secondary: None,
        }
    }

    /// The endpoint matching the given transport, if any.
    pub fn for_transport(&self, protocol: crate::types::TransportProtocol) -> Option<Endpoint> {
        [self.primary, self.secondary]
            .into_iter()
            .flatten()
            .find(|ep| ep.protocol == protocol)
    }

    /// Iterate over the present endpoints, primary first.
    pub fn iter(&self) -> impl Iterator<Item = Endpoint> {
        [self.primary, self.secondary].into_iter().flatten()
    }
}

/// A decoded SOME/IP-SD message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdMessage {
    /// Message flags.
    pub flags: SdFlags,
    /// Entries array.
    pub entries: Vec<SdEntry>,
    /// Options array shared by all entries.
    pub options: Vec<SdOption>,
}

impl SdMessage {
    /// Parse an SD message from its payload (after the SOME/IP header).
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < 12 {
            return Err(DecodeError::Truncated {
                expected: 12,
                actual: data.len(),
            });
        }

        let flags = SdFlags::from_u8(data[0]);
        // data[1..4] reserved

        let entries_length = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        let options_offset = 8 + entries_length;
        if data.len() < options_offset + 4 {
            return Err(DecodeError::Truncated {
                expected: options_offset + 4,
                actual: data.len(),
            });
        }
        if entries_length % SD_ENTRY_SIZE != 0 {
            return Err(DecodeError::LengthMismatch {
                header_length: entries_length as u32,
                actual_length: entries_length % SD_ENTRY_SIZE,
            });
        }

        let mut entries = Vec::with_capacity(entries_length / SD_ENTRY_SIZE);
        for chunk in data[8..options_offset].chunks_exact(SD_ENTRY_SIZE) {
            entries.push(SdEntry::from_bytes(chunk)?);
        }

        let options_length = u32::from_be_bytes([
            data[options_offset],
            data[options_offset + 1],
            data[options_offset + 2],
            data[options_offset + 3],
        ]) as usize;
        let options_data = &data[options_offset + 4..];
        if options_data.len() < options_length {
            return Err(DecodeError::Truncated {
                expected: options_length,
                actual: options_data.len(),
            });
        }

        let mut options = Vec::new();
        let mut offset = 0;
        while offset < options_length {
            let (option, size) = SdOption::from_bytes(&options_data[offset..options_length])?;
            options.push(option);
            offset += size;
        }

        Ok(Self {
            flags,
            entries,
            options,
        })
    }

    /// Parse an SD message from a full SOME/IP frame, checking the SD
    /// message id.
    pub fn from_frame(data: &[u8]) -> Result<Self, DecodeError> {
        let msg = SomeIpMessage::from_bytes(data)?;
        if msg.header.message_id() != SD_MESSAGE_ID {
            return Err(DecodeError::NotSdMessage(msg.header.message_id()));
        }
        Self::from_bytes(&msg.payload)
    }

    /// Serialize the SD payload (after the SOME/IP header).
    pub fn to_bytes(&self) -> Vec<u8> {
        let entries_length = self.entries.len() * SD_ENTRY_SIZE;
        let option_bytes: Vec<Vec<u8>> = self.options.iter().map(|o| o.to_bytes()).collect();
        let options_length: usize = option_bytes.iter().map(|b| b.len()).sum();

        let mut buf = Vec::with_capacity(12 + entries_length + options_length);
        buf.push(self.flags.to_u8());
        buf.extend_from_slice(&[0, 0, 0]); // reserved
        buf.extend_from_slice(&(entries_length as u32).to_be_bytes());
        for entry in &self.entries {
            buf.extend_from_slice(&entry.to_bytes());
        }
        buf.extend_from_slice(&(options_length as u32).to_be_bytes());
        for bytes in option_bytes {
            buf.extend_from_slice(&bytes);
        }
        buf
    }

    /// Wrap the payload in a SOME/IP frame ready to send.
    ///
    /// SD messages carry the fixed SD message id, zero client and session
    /// ids, NOTIFICATION type and E_OK.
    pub fn to_frame(&self) -> Vec<u8> {
        let payload = Bytes::from(self.to_bytes());
        let mut header = SomeIpHeader::new(
            ServiceId(super::types::SD_SERVICE_ID),
            crate::header::MethodId(super::types::SD_METHOD_ID),
            MessageType::Notification,
        );
        header.set_payload_length(payload.len() as u32);
        SomeIpMessage { header, payload }.to_bytes()
    }

    /// Resolve an entry's option runs into endpoints, bounds-checking every
    /// referenced index.
    pub fn resolve_endpoints(&self, entry: &SdEntry) -> Result<EndpointPair, DecodeError> {
        let runs = entry.runs();
        Ok(EndpointPair {
            primary: self.first_endpoint_of_run(runs.index1, runs.count1)?,
            secondary: self.first_endpoint_of_run(runs.index2, runs.count2)?,
        })
    }

    fn first_endpoint_of_run(
        &self,
        index: u8,
        count: u8,
    ) -> Result<Option<Endpoint>, DecodeError> {
        if count == 0 {
            return Ok(None);
        }
        let start = index as usize;
        let end = start + count as usize;
        if end > self.options.len() {
            return Err(DecodeError::OptionIndexOutOfRange {
                index: end - 1,
                available: self.options.len(),
            });
        }
        Ok(self.options[start..end].iter().find_map(|o| o.endpoint()))
    }
}

/// Builds one SD message, packing entries and deduplicating options.
///
/// Identical options are stored once and shared by index, so a pack of
/// offers for several instances behind the same endpoint stays compact.
#[derive(Debug, Default)]
pub struct SdMessageBuilder {
    flags: SdFlags,
    entries: Vec<SdEntry>,
    options: Vec<SdOption>,
    dedup: HashMap<SdOption, u8>,
}

impl SdMessageBuilder {
    /// Create a builder with the given flags.
    pub fn new(flags: SdFlags) -> Self {
        Self {
            flags,
            ..Default::default()
        }
    }

    /// Whether any entries have been added.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn option_index(&mut self, option: SdOption) -> u8 {
        if let Some(&index) = self.dedup.get(&option) {
            return index;
        }
        let index = self.options.len() as u8;
        self.options.push(option.clone());
        self.dedup.insert(option, index);
        index
    }

    fn runs_for(&mut self, endpoints: &EndpointPair) -> OptionRuns {
        let mut runs = OptionRuns::NONE;
        if let Some(primary) = endpoints.primary {
            runs.index1 = self.option_index(primary.to_option());
            runs.count1 = 1;
        }
        if let Some(secondary) = endpoints.secondary {
            runs.index2 = self.option_index(secondary.to_option());
            runs.count2 = 1;
        }
        runs
    }

    /// Add a Find-Service entry.
    pub fn find(
        &mut self,
        service_id: ServiceId,
        instance_id: InstanceId,
        major_version: u8,
        minor_version: u32,
    ) -> &mut Self {
        self.entries.push(SdEntry::Service(ServiceEntry::find(
            service_id,
            instance_id,
            major_version,
            minor_version,
        )));
        self
    }

    /// Add an Offer-Service entry with its endpoint options.
    pub fn offer(
        &mut self,
        service_id: ServiceId,
        instance_id: InstanceId,
        major_version: u8,
        minor_version: u32,
        ttl: u32,
        endpoints: &EndpointPair,
    ) -> &mut Self {
        let mut entry = ServiceEntry::offer(service_id, instance_id, major_version, minor_version, ttl);
        entry.runs = self.runs_for(endpoints);
        self.entries.push(SdEntry::Service(entry));
        self
    }

    /// Add a Stop-Offer entry. Ordered before any fresh Offer entries for
    /// the same instance already in the pack.
    pub fn stop_offer(
        &mut self,
        service_id: ServiceId,
        instance_id: InstanceId,
        major_version: u8,
        minor_version: u32,
    ) -> &mut Self {
        let entry = ServiceEntry::stop_offer(service_id, instance_id, major_version, minor_version);
        let insert_at = self
            .entries
            .iter()
            .position(|e| {
                matches!(e, SdEntry::Service(s)
                    if s.service_id == service_id && s.instance_id == instance_id && !s.is_stop_offer())
            })
            .unwrap_or(self.entries.len());
        self.entries.insert(insert_at, SdEntry::Service(entry));
        self
    }

    /// Add a Subscribe-Eventgroup entry with the subscriber's endpoint.
    pub fn subscribe(
        &mut self,
        service_id: ServiceId,
        instance_id: InstanceId,
        major_version: u8,
        eventgroup_id: EventgroupId,
        ttl: u32,
        endpoint: Endpoint,
    ) -> &mut Self {
        let mut entry =
            EventgroupEntry::subscribe(service_id, instance_id, major_version, eventgroup_id, ttl);
        entry.runs = self.runs_for(&EndpointPair::single(endpoint));
        self.entries.push(SdEntry::Eventgroup(entry));
        self
    }

    /// Add a Stop-Subscribe entry.
    pub fn stop_subscribe(
        &mut self,
        service_id: ServiceId,
        instance_id: InstanceId,
        major_version: u8,
        eventgroup_id: EventgroupId,
    ) -> &mut Self {
        self.entries.push(SdEntry::Eventgroup(EventgroupEntry::stop_subscribe(
            service_id,
            instance_id,
            major_version,
            eventgroup_id,
        )));
        self
    }

    /// Add a Subscribe-Ack entry, optionally carrying the server's endpoint.
    pub fn subscribe_ack(
        &mut self,
        service_id: ServiceId,
        instance_id: InstanceId,
        major_version: u8,
        eventgroup_id: EventgroupId,
        ttl: u32,
        counter: u8,
        endpoint: Option<Endpoint>,
    ) -> &mut Self {
        let mut entry =
            EventgroupEntry::ack(service_id, instance_id, major_version, eventgroup_id, ttl, counter);
        if let Some(ep) = endpoint {
            entry.runs = self.runs_for(&EndpointPair::single(ep));
        }
        self.entries.push(SdEntry::Eventgroup(entry));
        self
    }

    /// Add a Subscribe-Nack entry.
    pub fn subscribe_nack(
        &mut self,
        service_id: ServiceId,
        instance_id: InstanceId,
        major_version: u8,
        eventgroup_id: EventgroupId,
        counter: u8,
    ) -> &mut Self {
        self.entries.push(SdEntry::Eventgroup(EventgroupEntry::nack(
            service_id,
            instance_id,
            major_version,
            eventgroup_id,
            counter,
        )));
        self
    }

    /// Finalize into an [`SdMessage`].
    pub fn build(self) -> SdMessage {
        SdMessage {
            flags: self.flags,
            entries: self.entries,
            options: self.options,
        }
    }
}
