//! Service schema: methods, events and event groups.

use std::collections::{BTreeMap, BTreeSet};

use crate::header::{MethodId, ServiceId};
use crate::sd::types::EventgroupId;

/// An immutable service schema.
///
/// Built once by the application through [`ServiceBuilder`] and shared by
/// reference afterwards; the daemon consults it for method lookup and for
/// mapping events to event groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Service ID.
    pub service_id: ServiceId,
    /// Major interface version (carried in every data-plane header).
    pub major_version: u8,
    /// Minor version (advisory on offer matching).
    pub minor_version: u32,
    methods: BTreeSet<MethodId>,
    events: BTreeSet<MethodId>,
    eventgroups: BTreeMap<EventgroupId, BTreeSet<MethodId>>,
}

impl Service {
    /// Start building a schema for the given service id.
    pub fn builder(service_id: ServiceId) -> ServiceBuilder {
        ServiceBuilder {
            service_id,
            major_version: 1,
            minor_version: 0,
            methods: BTreeSet::new(),
            events: BTreeSet::new(),
            eventgroups: BTreeMap::new(),
        }
    }

    /// Check whether the schema declares the given method.
    pub fn has_method(&self, id: MethodId) -> bool {
        self.methods.contains(&id)
    }

    /// Check whether the schema declares the given event.
    pub fn has_event(&self, id: MethodId) -> bool {
        self.events.contains(&id)
    }

    /// Events bundled in the given event group, if it exists.
    pub fn eventgroup(&self, id: EventgroupId) -> Option<&BTreeSet<MethodId>> {
        self.eventgroups.get(&id)
    }

    /// Iterate over event groups containing the given event.
    pub fn eventgroups_containing(
        &self,
        event: MethodId,
    ) -> impl Iterator<Item = EventgroupId> + '_ {
        self.eventgroups
            .iter()
            .filter(move |(_, events)| events.contains(&event))
            .map(|(id, _)| *id)
    }

    /// Declared method ids.
    pub fn methods(&self) -> impl Iterator<Item = MethodId> + '_ {
        self.methods.iter().copied()
    }

    /// Declared event ids.
    pub fn events(&self) -> impl Iterator<Item = MethodId> + '_ {
        self.events.iter().copied()
    }

    /// Declared event groups.
    pub fn eventgroups(&self) -> impl Iterator<Item = (EventgroupId, &BTreeSet<MethodId>)> {
        self.eventgroups.iter().map(|(id, ev)| (*id, ev))
    }
}

/// Builder for [`Service`] schemas.
#[derive(Debug, Clone)]
pub struct ServiceBuilder {
    service_id: ServiceId,
    major_version: u8,
    minor_version: u32,
    methods: BTreeSet<MethodId>,
    events: BTreeSet<MethodId>,
    eventgroups: BTreeMap<EventgroupId, BTreeSet<MethodId>>,
}

impl ServiceBuilder {
    /// Set the major version.
    pub fn major_version(mut self, major: u8) -> Self {
        self.major_version = major;
        self
    }

    /// Set the minor version.
    pub fn minor_version(mut self, minor: u32) -> Self {
        self.minor_version = minor;
        self
    }

    /// Declare a method. The event bit is cleared.
    pub fn method(mut self, id: u16) -> Self {
        self.methods.insert(MethodId::method(id));
        self
    }

    /// Declare an event. The event bit is set.
    pub fn event(mut self, id: u16) -> Self {
        self.events.insert(MethodId::event(id));
        self
    }

    /// Declare an event group bundling the given event ids.
    ///
    /// Events named here are added to the event set as well, so a schema can
    /// be declared group-first.
    pub fn eventgroup(mut self, id: EventgroupId, event_ids: impl IntoIterator<Item = u16>) -> Self {
        let events: BTreeSet<MethodId> = event_ids.into_iter().map(MethodId::event).collect();
        self.events.extend(events.iter().copied());
        self.eventgroups.entry(id).or_default().extend(events);
        self
    }

    /// Finalize the schema.
    pub fn build(self) -> Service {
        Service {
            service_id: self.service_id,
            major_version: self.major_version,
            minor_version: self.minor_version,
            methods: self.methods,
            events: self.events,
            eventgroups: self.eventgroups,
        }
    }
}
