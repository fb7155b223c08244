//! Well-known node addresses and link filters of the hub's AMQP surface

use chrono::{DateTime, Utc};

/// Management node answering entity READ requests
pub const MANAGEMENT_NODE: &str = "$management";

/// Claims-based security node accepting put-token requests
pub const CBS_NODE: &str = "$cbs";

/// Reply address used for claims-based security responses
pub const CBS_REPLY_TO: &str = "cbs";

/// Entity type sent with management READ requests
pub const EVENTHUB_ENTITY_TYPE: &str = "com.microsoft:eventhub";

/// Consumer group every event hub has
pub const DEFAULT_CONSUMER_GROUP: &str = "$Default";

/// Node address builders
pub struct AddressBuilder;

impl AddressBuilder {
    /// Partition receive address: `/{name}/ConsumerGroups/{group}/Partitions/{id}`
    pub fn partition(name: &str, group: &str, partition_id: &str) -> String {
        format!("/{name}/ConsumerGroups/{group}/Partitions/{partition_id}")
    }

    /// Fresh reply address for one request/response exchange
    pub fn reply_address() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// AMQP URL of a hub host
    pub fn amqps_url(hostname: &str) -> String {
        format!("amqps://{hostname}")
    }
}

/// Server-side filter applied to a receiver link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFilter {
    /// Only messages enqueued at or after the given instant
    EnqueuedAtOrAfter(DateTime<Utc>),
}

impl LinkFilter {
    /// Selector expression understood by the broker
    pub fn selector(&self) -> String {
        match self {
            LinkFilter::EnqueuedAtOrAfter(at) => format!(
                "amqp.annotation.x-opt-enqueuedtimeutc >= '{}'",
                at.timestamp_millis()
            ),
        }
    }

    /// Evaluate the filter locally against a message's enqueue time; messages without an
    /// enqueue time never pass
    pub fn accepts(&self, enqueued_time: Option<DateTime<Utc>>) -> bool {
        match (self, enqueued_time) {
            (LinkFilter::EnqueuedAtOrAfter(at), Some(t)) => t.timestamp_millis() >= at.timestamp_millis(),
            (LinkFilter::EnqueuedAtOrAfter(_), None) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    #[test]
    fn test_partition_address() {
        assert_eq!(
            AddressBuilder::partition("telemetry", "$Default", "0"),
            "/telemetry/ConsumerGroups/$Default/Partitions/0"
        );
    }

    #[test]
    fn test_reply_addresses_are_unique() {
        assert_ne!(AddressBuilder::reply_address(), AddressBuilder::reply_address());
    }

    #[test]
    fn test_selector_uses_unix_millis() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(
            LinkFilter::EnqueuedAtOrAfter(at).selector(),
            "amqp.annotation.x-opt-enqueuedtimeutc >= '1700000000123'"
        );
    }

    #[test]
    fn test_filter_boundaries() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let filter = LinkFilter::EnqueuedAtOrAfter(at);

        assert!(filter.accepts(Some(at)));
        assert!(filter.accepts(Some(at + Duration::milliseconds(1))));
        assert!(!filter.accepts(Some(at - Duration::milliseconds(1))));
        assert!(!filter.accepts(None));
    }

    proptest! {
        #[test]
        fn filter_never_accepts_earlier_messages(start in 0i64..4_000_000_000_000, offset in 1i64..1_000_000) {
            let at = Utc.timestamp_millis_opt(start).unwrap();
            let filter = LinkFilter::EnqueuedAtOrAfter(at);
            prop_assert!(!filter.accepts(Some(at - Duration::milliseconds(offset))));
            prop_assert!(filter.accepts(Some(at + Duration::milliseconds(offset))));
        }
    }
}
