use std::collections::HashMap;

use aws_sdk_dynamodb::error::SdkError;
use aws_sdk_dynamodb::operation::update_item::UpdateItemError;
use aws_sdk_dynamodb::types::{AttributeValue, ReturnValue};
use chrono::{DateTime, Duration, SecondsFormat, Utc};

use crate::adapters::blocking::block_on_sdk;
use crate::adapters::sdk_errors::replication_error;
use crate::runtime::contract::EventKind;
use crate::runtime::error::ReplicationError;
use crate::runtime::ordering::OrderToken;
use crate::runtime::version::{decide_claim, ClaimDecision, VersionRecord, VersionStatus};

pub const ATTR_KEY: &str = "Key";
pub const ATTR_VERSION_ID: &str = "VersionId";
pub const ATTR_STATUS: &str = "Status";
pub const ATTR_ATTEMPTS: &str = "Attempts";
pub const ATTR_UPDATED_AT: &str = "UpdatedAt";
pub const ATTR_ORDER_TOKEN: &str = "OrderToken";
pub const ATTR_VERSION_ORDER: &str = "VersionOrder";
pub const ATTR_CLAIM: &str = "Claim";
pub const ATTR_EVENT_KIND: &str = "EventKind";
pub const ATTR_LEASE_EXPIRES_AT: &str = "LeaseExpiresAt";
pub const ATTR_DEST_VERSION_ID: &str = "DestVersionId";
pub const ATTR_LAST_ERROR: &str = "LastError";

/// Inputs of the conditional Processing transition.
#[derive(Debug, Clone)]
pub struct ClaimRequest<'a> {
    pub key: &'a str,
    pub version_id: &'a str,
    pub order_token: &'a OrderToken,
    /// Set only by the event that creates the version.
    pub version_order: Option<&'a OrderToken>,
    pub claim_id: &'a str,
    pub event_kind: EventKind,
    pub now: DateTime<Utc>,
    pub lease: Duration,
}

impl ClaimRequest<'_> {
    /// Record as it reads after a successful claim over `previous`.
    pub fn claimed_record(&self, previous: Option<&VersionRecord>) -> VersionRecord {
        VersionRecord {
            key: self.key.to_string(),
            version_id: self.version_id.to_string(),
            status: VersionStatus::Processing,
            attempts: previous.map_or(0, |record| record.attempts) + 1,
            updated_at: self.now,
            order_token: self.order_token.clone(),
            version_order: self
                .version_order
                .cloned()
                .or_else(|| previous.and_then(|record| record.version_order.clone())),
            claim: self.claim_id.to_string(),
            event_kind: self.event_kind,
            lease_expires_at: self.now + self.lease,
            destination_version_id: previous.and_then(|record| record.destination_version_id.clone()),
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Acquired(VersionRecord),
    AlreadyCompleted(VersionRecord),
    InFlight(VersionRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationMapping {
    Unchanged,
    Set(String),
    Cleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    Settled,
    /// The lease was taken over; the row now belongs to another delivery.
    ClaimLost,
}

/// Durable (key, version_id) table. All mutation is single-row and
/// conditional; no implementation may hold a lock beyond one call.
pub trait VersionStore {
    /// Every row of the key, in no particular order.
    fn history(&self, key: &str) -> Result<Vec<VersionRecord>, ReplicationError>;

    fn claim(&self, request: &ClaimRequest<'_>) -> Result<ClaimOutcome, ReplicationError>;

    fn complete(
        &self,
        record: &VersionRecord,
        mapping: &DestinationMapping,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome, ReplicationError>;

    fn fail(
        &self,
        record: &VersionRecord,
        error: &ReplicationError,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome, ReplicationError>;
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

type Item = HashMap<String, AttributeValue>;

fn string_attr<'a>(item: &'a Item, name: &str) -> Result<&'a str, ReplicationError> {
    item.get(name)
        .and_then(|value| value.as_s().ok())
        .map(String::as_str)
        .ok_or_else(|| ReplicationError::transient("read_version_record", format!("missing {name}")))
}

fn optional_string_attr(item: &Item, name: &str) -> Option<String> {
    item.get(name)
        .and_then(|value| value.as_s().ok())
        .cloned()
}

fn number_attr(item: &Item, name: &str) -> Result<i64, ReplicationError> {
    item.get(name)
        .and_then(|value| value.as_n().ok())
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| ReplicationError::transient("read_version_record", format!("missing {name}")))
}

pub fn item_to_record(item: &Item) -> Result<VersionRecord, ReplicationError> {
    let corrupt = |detail: String| ReplicationError::transient("read_version_record", detail);

    let status = string_attr(item, ATTR_STATUS)?
        .parse::<VersionStatus>()
        .map_err(corrupt)?;
    let event_kind_name = string_attr(item, ATTR_EVENT_KIND)?;
    let event_kind = EventKind::from_name(event_kind_name)
        .ok_or_else(|| corrupt(format!("unknown event kind '{event_kind_name}'")))?;
    let updated_at = DateTime::parse_from_rfc3339(string_attr(item, ATTR_UPDATED_AT)?)
        .map_err(|error| corrupt(format!("invalid {ATTR_UPDATED_AT}: {error}")))?
        .with_timezone(&Utc);
    let lease_expires_at = DateTime::from_timestamp(number_attr(item, ATTR_LEASE_EXPIRES_AT)?, 0)
        .ok_or_else(|| corrupt(format!("invalid {ATTR_LEASE_EXPIRES_AT}")))?;

    Ok(VersionRecord {
        key: string_attr(item, ATTR_KEY)?.to_string(),
        version_id: string_attr(item, ATTR_VERSION_ID)?.to_string(),
        status,
        attempts: u32::try_from(number_attr(item, ATTR_ATTEMPTS)?).unwrap_or(u32::MAX),
        updated_at,
        order_token: OrderToken::from_stored(string_attr(item, ATTR_ORDER_TOKEN)?),
        version_order: optional_string_attr(item, ATTR_VERSION_ORDER)
            .map(OrderToken::from_stored),
        claim: string_attr(item, ATTR_CLAIM)?.to_string(),
        event_kind,
        lease_expires_at,
        destination_version_id: optional_string_attr(item, ATTR_DEST_VERSION_ID),
        last_error: optional_string_attr(item, ATTR_LAST_ERROR),
    })
}

fn is_conditional_check_failed<R>(error: &SdkError<UpdateItemError, R>) -> bool {
    match error {
        SdkError::ServiceError(service) => {
            matches!(service.err(), UpdateItemError::ConditionalCheckFailedException(_))
        }
        _ => false,
    }
}

pub struct DynamoVersionStore {
    client: aws_sdk_dynamodb::Client,
    table_name: String,
}

impl DynamoVersionStore {
    pub fn new(client: aws_sdk_dynamodb::Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    fn get_record(&self, key: &str, version_id: &str) -> Result<Option<VersionRecord>, ReplicationError> {
        let request = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(ATTR_KEY, AttributeValue::S(key.to_string()))
            .key(ATTR_VERSION_ID, AttributeValue::S(version_id.to_string()))
            .consistent_read(true);

        let output = block_on_sdk(request.send())
            .map_err(|error| replication_error("get_item", &error, None))?;
        output.item().map(item_to_record).transpose()
    }

    fn settle(
        &self,
        record: &VersionRecord,
        operation: &str,
        update_expression: String,
        values: Vec<(&str, AttributeValue)>,
        names: Vec<(&str, &str)>,
    ) -> Result<SettleOutcome, ReplicationError> {
        let mut request = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key(ATTR_KEY, AttributeValue::S(record.key.clone()))
            .key(ATTR_VERSION_ID, AttributeValue::S(record.version_id.clone()))
            .update_expression(update_expression)
            .condition_expression("#cl = :claim AND #st = :processing")
            .expression_attribute_names("#cl", ATTR_CLAIM)
            .expression_attribute_names("#st", ATTR_STATUS)
            .expression_attribute_values(":claim", AttributeValue::S(record.claim.clone()))
            .expression_attribute_values(
                ":processing",
                AttributeValue::S(VersionStatus::Processing.as_str().to_string()),
            );
        for (placeholder, name) in names {
            request = request.expression_attribute_names(placeholder, name);
        }
        for (placeholder, value) in values {
            request = request.expression_attribute_values(placeholder, value);
        }

        match block_on_sdk(request.send()) {
            Ok(_) => Ok(SettleOutcome::Settled),
            Err(error) if is_conditional_check_failed(&error) => Ok(SettleOutcome::ClaimLost),
            Err(error) => Err(replication_error(operation, &error, None)),
        }
    }
}

impl VersionStore for DynamoVersionStore {
    fn history(&self, key: &str) -> Result<Vec<VersionRecord>, ReplicationError> {
        let mut records = Vec::new();
        let mut exclusive_start_key = None;

        loop {
            let request = self
                .client
                .query()
                .table_name(&self.table_name)
                .key_condition_expression("#pk = :key")
                .expression_attribute_names("#pk", ATTR_KEY)
                .expression_attribute_values(":key", AttributeValue::S(key.to_string()))
                .consistent_read(true)
                .set_exclusive_start_key(exclusive_start_key.take());

            let output = block_on_sdk(request.send())
                .map_err(|error| replication_error("query", &error, None))?;

            for item in output.items() {
                records.push(item_to_record(item)?);
            }

            match output.last_evaluated_key() {
                Some(last_key) if !last_key.is_empty() => {
                    exclusive_start_key = Some(last_key.clone());
                }
                _ => break,
            }
        }

        Ok(records)
    }

    fn claim(&self, request: &ClaimRequest<'_>) -> Result<ClaimOutcome, ReplicationError> {
        let lease_expires_at = request.now + request.lease;
        let mut update_expression = String::from(
            "SET #st = :processing, #att = if_not_exists(#att, :zero) + :one, #ua = :now, \
             #ot = :order, #cl = :claim, #ek = :kind, #le = :lease",
        );
        if request.version_order.is_some() {
            update_expression.push_str(", #vo = :version_order");
        }
        update_expression.push_str(" REMOVE #err");

        let mut update = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key(ATTR_KEY, AttributeValue::S(request.key.to_string()))
            .key(ATTR_VERSION_ID, AttributeValue::S(request.version_id.to_string()))
            .update_expression(update_expression)
            // Mirrors `decide_claim`.
            .condition_expression(
                "attribute_not_exists(#pk) OR #st = :failed \
                 OR (#st = :completed AND #ot < :order) \
                 OR (#st = :processing AND #le <= :now_epoch)",
            )
            .expression_attribute_names("#pk", ATTR_KEY)
            .expression_attribute_names("#st", ATTR_STATUS)
            .expression_attribute_names("#att", ATTR_ATTEMPTS)
            .expression_attribute_names("#ua", ATTR_UPDATED_AT)
            .expression_attribute_names("#ot", ATTR_ORDER_TOKEN)
            .expression_attribute_names("#cl", ATTR_CLAIM)
            .expression_attribute_names("#ek", ATTR_EVENT_KIND)
            .expression_attribute_names("#le", ATTR_LEASE_EXPIRES_AT)
            .expression_attribute_names("#err", ATTR_LAST_ERROR)
            .expression_attribute_values(
                ":processing",
                AttributeValue::S(VersionStatus::Processing.as_str().to_string()),
            )
            .expression_attribute_values(
                ":completed",
                AttributeValue::S(VersionStatus::Completed.as_str().to_string()),
            )
            .expression_attribute_values(
                ":failed",
                AttributeValue::S(VersionStatus::Failed.as_str().to_string()),
            )
            .expression_attribute_values(":zero", AttributeValue::N("0".to_string()))
            .expression_attribute_values(":one", AttributeValue::N("1".to_string()))
            .expression_attribute_values(":now", AttributeValue::S(format_timestamp(request.now)))
            .expression_attribute_values(
                ":now_epoch",
                AttributeValue::N(request.now.timestamp().to_string()),
            )
            .expression_attribute_values(
                ":order",
                AttributeValue::S(request.order_token.as_str().to_string()),
            )
            .expression_attribute_values(":claim", AttributeValue::S(request.claim_id.to_string()))
            .expression_attribute_values(
                ":kind",
                AttributeValue::S(request.event_kind.as_str().to_string()),
            )
            .expression_attribute_values(
                ":lease",
                AttributeValue::N(lease_expires_at.timestamp().to_string()),
            )
            .return_values(ReturnValue::AllOld);
        if let Some(order) = request.version_order {
            update = update
                .expression_attribute_names("#vo", ATTR_VERSION_ORDER)
                .expression_attribute_values(":version_order", AttributeValue::S(order.as_str().to_string()));
        }

        match block_on_sdk(update.send()) {
            Ok(output) => {
                let previous = output.attributes().map(item_to_record).transpose()?;
                Ok(ClaimOutcome::Acquired(request.claimed_record(previous.as_ref())))
            }
            Err(error) if is_conditional_check_failed(&error) => {
                let existing = self
                    .get_record(request.key, request.version_id)?
                    .ok_or_else(|| {
                        ReplicationError::transient("claim", "row vanished after a failed condition")
                    })?;
                match decide_claim(Some(&existing), request.order_token, request.now) {
                    ClaimDecision::AlreadyCompleted => Ok(ClaimOutcome::AlreadyCompleted(existing)),
                    ClaimDecision::InFlight => Ok(ClaimOutcome::InFlight(existing)),
                    ClaimDecision::Acquire => Err(ReplicationError::transient(
                        "claim",
                        "row changed between the condition check and the re-read",
                    )),
                }
            }
            Err(error) => Err(replication_error("update_item", &error, None)),
        }
    }

    fn complete(
        &self,
        record: &VersionRecord,
        mapping: &DestinationMapping,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome, ReplicationError> {
        let mut values = vec![
            (
                ":completed",
                AttributeValue::S(VersionStatus::Completed.as_str().to_string()),
            ),
            (":now", AttributeValue::S(format_timestamp(now))),
        ];
        let mut names = vec![("#ua", ATTR_UPDATED_AT), ("#err", ATTR_LAST_ERROR)];
        let update_expression = match mapping {
            DestinationMapping::Unchanged => "SET #st = :completed, #ua = :now REMOVE #err",
            DestinationMapping::Set(version_id) => {
                names.push(("#dv", ATTR_DEST_VERSION_ID));
                values.push((":dest", AttributeValue::S(version_id.clone())));
                "SET #st = :completed, #ua = :now, #dv = :dest REMOVE #err"
            }
            DestinationMapping::Cleared => {
                names.push(("#dv", ATTR_DEST_VERSION_ID));
                "SET #st = :completed, #ua = :now REMOVE #err, #dv"
            }
        };

        self.settle(record, "complete", update_expression.to_string(), values, names)
    }

    fn fail(
        &self,
        record: &VersionRecord,
        error: &ReplicationError,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome, ReplicationError> {
        let values = vec![
            (
                ":failed",
                AttributeValue::S(VersionStatus::Failed.as_str().to_string()),
            ),
            (":now", AttributeValue::S(format_timestamp(now))),
            (
                ":error",
                AttributeValue::S(format!("{}: {error}", error.error_code())),
            ),
        ];
        let names = vec![("#ua", ATTR_UPDATED_AT), ("#err", ATTR_LAST_ERROR)];

        self.settle(
            record,
            "fail",
            "SET #st = :failed, #ua = :now, #err = :error".to_string(),
            values,
            names,
        )
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn sample_item() -> Item {
        HashMap::from([
            (ATTR_KEY.to_string(), AttributeValue::S("a.txt".to_string())),
            (ATTR_VERSION_ID.to_string(), AttributeValue::S("v1".to_string())),
            (ATTR_STATUS.to_string(), AttributeValue::S("Completed".to_string())),
            (ATTR_ATTEMPTS.to_string(), AttributeValue::N("2".to_string())),
            (
                ATTR_UPDATED_AT.to_string(),
                AttributeValue::S("2026-02-14T10:00:05.000000Z".to_string()),
            ),
            (
                ATTR_ORDER_TOKEN.to_string(),
                AttributeValue::S("2026-02-14T10:00:00.000000Z#0".to_string()),
            ),
            (
                ATTR_VERSION_ORDER.to_string(),
                AttributeValue::S("2026-02-14T10:00:00.000000Z#0".to_string()),
            ),
            (ATTR_CLAIM.to_string(), AttributeValue::S("m-1@x".to_string())),
            (ATTR_EVENT_KIND.to_string(), AttributeValue::S("created".to_string())),
            (ATTR_LEASE_EXPIRES_AT.to_string(), AttributeValue::N("1771063200".to_string())),
            (ATTR_DEST_VERSION_ID.to_string(), AttributeValue::S("d-1".to_string())),
        ])
    }

    #[test]
    fn reads_completed_row() {
        let record = item_to_record(&sample_item()).expect("row should parse");

        assert_eq!(record.status, VersionStatus::Completed);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.event_kind, EventKind::Created);
        assert_eq!(record.destination_version_id.as_deref(), Some("d-1"));
        assert_eq!(record.last_error, None);
        assert_eq!(
            record.updated_at,
            Utc.with_ymd_and_hms(2026, 2, 14, 10, 0, 5)
                .single()
                .expect("valid time")
        );
    }

    #[test]
    fn non_string_destination_reads_as_absent() {
        let mut item = sample_item();
        item.insert(ATTR_DEST_VERSION_ID.to_string(), AttributeValue::Null(true));

        let record = item_to_record(&item).expect("row should parse");
        assert_eq!(record.destination_version_id, None);
    }

    #[test]
    fn rows_with_unknown_status_are_rejected() {
        let mut item = sample_item();
        item.insert(ATTR_STATUS.to_string(), AttributeValue::S("Archived".to_string()));

        assert!(item_to_record(&item).is_err());
    }

    #[test]
    fn claim_over_completed_row_counts_the_attempt_and_keeps_the_mapping() {
        let previous = item_to_record(&sample_item()).expect("row should parse");
        let token = OrderToken::new(
            Utc.with_ymd_and_hms(2026, 2, 14, 11, 0, 0)
                .single()
                .expect("valid time"),
            None,
        );
        let now = Utc
            .with_ymd_and_hms(2026, 2, 14, 11, 0, 1)
            .single()
            .expect("valid time");
        let request = ClaimRequest {
            key: "a.txt",
            version_id: "v1",
            order_token: &token,
            version_order: None,
            claim_id: "m-2@y",
            event_kind: EventKind::TagsAdded,
            now,
            lease: Duration::seconds(900),
        };

        let record = request.claimed_record(Some(&previous));
        assert_eq!(record.status, VersionStatus::Processing);
        assert_eq!(record.attempts, 3);
        assert_eq!(record.destination_version_id.as_deref(), Some("d-1"));
        assert_eq!(record.lease_expires_at, now + Duration::seconds(900));
        // A tag change must not move the version in the key's history.
        assert_eq!(record.version_order, previous.version_order);
        assert_eq!(record.order_token, token);
    }

    #[test]
    fn rows_written_before_a_creation_event_have_no_version_order() {
        let mut item = sample_item();
        item.remove(ATTR_VERSION_ORDER);

        let record = item_to_record(&item).expect("row should parse");
        assert_eq!(record.version_order, None);
    }

    #[test]
    fn timestamps_have_fixed_precision() {
        let value = Utc
            .with_ymd_and_hms(2026, 2, 14, 10, 0, 0)
            .single()
            .expect("valid time");
        assert_eq!(format_timestamp(value), "2026-02-14T10:00:00.000000Z");
    }
}
