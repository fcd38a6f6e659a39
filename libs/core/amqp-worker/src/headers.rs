//! Conversion between message metadata and AMQP header tables.

use lapin::types::{AMQPValue, FieldTable, ShortString};
use messaging::Metadata;
use tracing::warn;

/// Metadata as an AMQP header table. Every value is sent as a long string.
pub fn to_field_table(metadata: &Metadata) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in metadata {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(value.clone().into()),
        );
    }
    table
}

/// Header table as metadata.
///
/// String headers are kept as they are. Other scalar types are rendered to
/// text; nested tables and arrays are skipped.
pub fn from_field_table(table: Option<&FieldTable>) -> Metadata {
    let mut metadata = Metadata::new();
    let Some(table) = table else {
        return metadata;
    };

    for (key, value) in table.inner() {
        let text = match value {
            AMQPValue::LongString(s) => match std::str::from_utf8(s.as_bytes()) {
                Ok(s) => s.to_string(),
                Err(e) => {
                    warn!(header = %key.as_str(), error = %e, "Skipping non UTF-8 header");
                    continue;
                }
            },
            AMQPValue::ShortString(s) => s.as_str().to_string(),
            AMQPValue::Boolean(b) => b.to_string(),
            AMQPValue::ShortShortInt(n) => n.to_string(),
            AMQPValue::ShortShortUInt(n) => n.to_string(),
            AMQPValue::ShortInt(n) => n.to_string(),
            AMQPValue::ShortUInt(n) => n.to_string(),
            AMQPValue::LongInt(n) => n.to_string(),
            AMQPValue::LongUInt(n) => n.to_string(),
            AMQPValue::LongLongInt(n) => n.to_string(),
            _ => continue,
        };
        metadata.insert(key.as_str().to_string(), text);
    }
    metadata
}
