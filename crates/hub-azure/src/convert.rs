//! Mapping between the contract's message types and the SDK's.

use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

use azure_messaging_eventhubs::models::{AmqpSimpleValue, EventData as SdkEventData, ReceivedEventData};
use azure_messaging_eventhubs::{StartLocation, StartPosition as SdkStartPosition};
use hub_contract::{EventData, HubError, ReceivedEvent, StartPosition};
use serde_json::Value;

pub(crate) const JSON_CONTENT_TYPE: &str = "application/json";

pub(crate) fn outbound(event: &EventData) -> Result<SdkEventData, HubError> {
    let body = serde_json::to_vec(&event.body).map_err(|err| HubError::InvalidRequest {
        detail: format!("event body is not serialisable: {err}"),
    })?;
    let builder = event.properties.iter().fold(
        SdkEventData::builder()
            .with_body(body)
            .with_content_type(JSON_CONTENT_TYPE.to_string()),
        |builder, (key, value)| builder.add_property(key.clone(), value.clone()),
    );
    Ok(builder.build())
}

pub(crate) fn received(partition_id: &str, event: &ReceivedEventData) -> Result<ReceivedEvent, HubError> {
    let data = event.event_data();
    assemble(
        partition_id,
        data.body(),
        data.properties(),
        event.offset().as_deref(),
        event.sequence_number(),
        event.enqueued_time(),
    )
}

/// Build a [`ReceivedEvent`] from the parts the service delivered.
pub(crate) fn assemble(
    partition_id: &str,
    body: Option<&[u8]>,
    properties: Option<&HashMap<String, AmqpSimpleValue>>,
    offset: Option<&str>,
    sequence_number: Option<i64>,
    enqueued_time: Option<SystemTime>,
) -> Result<ReceivedEvent, HubError> {
    let offset = offset
        .ok_or_else(|| HubError::unexpected(format!("event on partition {partition_id} has no offset")))?;
    let offset = offset.parse::<i64>().map_err(|_| {
        HubError::unexpected(format!(
            "event on partition {partition_id} has non-numeric offset {offset:?}"
        ))
    })?;
    Ok(ReceivedEvent {
        body: decode_body(body),
        properties: properties.map(string_properties).unwrap_or_default(),
        partition_id: partition_id.to_string(),
        offset,
        sequence_number: sequence_number.unwrap_or(offset),
        enqueued_time: enqueued_time.unwrap_or(SystemTime::UNIX_EPOCH),
    })
}

fn decode_body(body: Option<&[u8]>) -> Value {
    match body {
        None | Some([]) => Value::Null,
        Some(bytes) => serde_json::from_slice(bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned())),
    }
}

fn string_properties(properties: &HashMap<String, AmqpSimpleValue>) -> BTreeMap<String, String> {
    properties
        .iter()
        .map(|(key, value)| {
            let value = match value {
                AmqpSimpleValue::String(text) => text.clone(),
                other => format!("{other:?}"),
            };
            (key.clone(), value)
        })
        .collect()
}

/// Where a partition receiver opens.
///
/// A stored checkpoint wins over the requested position. `Latest` is pinned to
/// the partition's last enqueued sequence number at subscribe time, so events
/// sent after `subscribe` returns are never skipped; `None` means the partition
/// is empty.
pub(crate) fn start_position(
    checkpoint: Option<i64>,
    requested: StartPosition,
    last_enqueued: Option<i64>,
) -> SdkStartPosition {
    let location = match (checkpoint, requested) {
        (Some(offset), _) | (None, StartPosition::Offset(offset)) => {
            StartLocation::Offset(offset.to_string())
        }
        (None, StartPosition::Earliest) => StartLocation::Earliest,
        (None, StartPosition::Latest) => {
            last_enqueued.map_or(StartLocation::Earliest, StartLocation::SequenceNumber)
        }
    };
    SdkStartPosition {
        location,
        inclusive: false,
    }
}
